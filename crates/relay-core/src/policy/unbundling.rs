//! Destination receipts back to bundles.

use super::PolicyError;
use relay_types::{Address, Bundle, ChainHasher, Log, Receipt, Transfer, B256};

/// Topics of a processed event: signature, source block hash, bundle hash.
const PROCESSED_TOPIC_COUNT: usize = 3;

/// Topics of a distributed event: signature, source tx hash, recipient, amount.
const DISTRIBUTED_TOPIC_COUNT: usize = 4;

/// Rebuilds the bundles a `submitBundle` transaction paid out.
///
/// The bridge emits one distributed event per transfer, followed by a
/// processed event closing the bundle. Events from other contracts and
/// unknown signatures are ignored.
#[derive(Debug, Clone)]
pub struct UnbundlingPolicy {
	contract: Address,
	processed: B256,
	distributed: B256,
}

impl UnbundlingPolicy {
	pub fn new(hasher: ChainHasher, contract: Address, processed_event: &str, distributed_event: &str) -> Self {
		Self {
			contract,
			processed: hasher.event_signature(processed_event),
			distributed: hasher.event_signature(distributed_event),
		}
	}

	/// Decodes every bundle recorded in `receipt`.
	///
	/// The source block number is not part of the events and is left at zero.
	pub fn from_receipt(&self, receipt: &Receipt) -> Result<Vec<Bundle>, PolicyError> {
		let mut bundles = Vec::new();
		let mut pending = Vec::new();

		for log in receipt.logs.iter().filter(|log| log.address == self.contract) {
			match log.topic(0) {
				Some(sig) if *sig == self.distributed => {
					expect_topics(log, "Distributed", DISTRIBUTED_TOPIC_COUNT)?;
					pending.push(decode_transfer(receipt, log)?);
				},
				Some(sig) if *sig == self.processed => {
					expect_topics(log, "Processed", PROCESSED_TOPIC_COUNT)?;
					let source_block_hash = log.topics[1];
					let index = bundles.len() as u32;
					let bundle = Bundle::new(0, source_block_hash, index, std::mem::take(&mut pending));
					if *bundle.bundle_hash() != log.topics[2] {
						return Err(PolicyError::MalformedPayout {
							tx_hash: receipt.transaction_hash.to_string(),
							reason: format!(
								"processed event names bundle {} but the paid transfers hash to {}",
								log.topics[2],
								bundle.bundle_hash()
							),
						});
					}
					bundles.push(bundle);
				},
				other => {
					tracing::debug!(
						tx_hash = %receipt.transaction_hash,
						topic = ?other,
						"Ignoring unrelated log"
					);
				},
			}
		}

		if !pending.is_empty() {
			tracing::debug!(
				tx_hash = %receipt.transaction_hash,
				transfers = pending.len(),
				"Distributed events without a closing processed event"
			);
		}
		Ok(bundles)
	}
}

fn expect_topics(log: &Log, event: &'static str, expected: usize) -> Result<(), PolicyError> {
	if log.topics.len() != expected {
		return Err(PolicyError::TopicCount {
			event,
			expected,
			actual: log.topics.len(),
		});
	}
	Ok(())
}

/// Amount is the fourth topic, a uint128 whose high 16 bytes must be zero.
fn decode_transfer(receipt: &Receipt, log: &Log) -> Result<Transfer, PolicyError> {
	let word = &log.topics[3];
	if word[..16].iter().any(|b| *b != 0) {
		return Err(PolicyError::MalformedPayout {
			tx_hash: receipt.transaction_hash.to_string(),
			reason: format!("amount {} does not fit in 128 bits", word),
		});
	}
	let mut amount = [0u8; 16];
	amount.copy_from_slice(&word[16..]);
	Ok(Transfer::new(
		log.topics[1],
		Address::from_word(log.topics[2]),
		u128::from_be_bytes(amount),
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_chain::testing::{block, receipt};
	use relay_types::{Bytes, U256};

	const PROCESSED: &str = "Processed(bytes32,bytes32)";
	const DISTRIBUTED: &str = "Distributed(bytes32,address,uint128)";

	fn contract() -> Address {
		Address::repeat_byte(0xbb)
	}

	fn policy() -> UnbundlingPolicy {
		UnbundlingPolicy::new(ChainHasher::Keccak256, contract(), PROCESSED, DISTRIBUTED)
	}

	fn distributed(transfer: &Transfer) -> Log {
		Log {
			address: contract(),
			data: Bytes::new(),
			topics: vec![
				ChainHasher::Keccak256.event_signature(DISTRIBUTED),
				transfer.source_tx_hash,
				transfer.recipient.into_word(),
				B256::from(U256::from(transfer.amount)),
			],
		}
	}

	fn processed(bundle: &Bundle) -> Log {
		Log {
			address: contract(),
			data: Bytes::new(),
			topics: vec![
				ChainHasher::Keccak256.event_signature(PROCESSED),
				*bundle.source_block_hash(),
				*bundle.bundle_hash(),
			],
		}
	}

	fn sample_bundle() -> Bundle {
		Bundle::new(
			12,
			B256::repeat_byte(0x12),
			0,
			vec![
				Transfer::new(B256::repeat_byte(1), Address::repeat_byte(0x11), 100),
				Transfer::new(B256::repeat_byte(2), Address::repeat_byte(0x22), 200),
			],
		)
	}

	#[test]
	fn test_receipt_round_trips_bundle_transfers() {
		let bundle = sample_bundle();
		let mut logs: Vec<Log> = bundle.transfers().iter().map(distributed).collect();
		logs.push(processed(&bundle));
		let shell = block(40, B256::ZERO, vec![B256::repeat_byte(9)]);
		let r = receipt(&shell, B256::repeat_byte(9), 0, logs);

		let decoded = policy().from_receipt(&r).unwrap();
		assert_eq!(decoded.len(), 1);
		assert!(bundle.same_transfers(decoded[0].transfers()));
		assert_eq!(decoded[0].bundle_hash(), bundle.bundle_hash());
	}

	#[test]
	fn test_wrong_topic_count_is_structural() {
		let bundle = sample_bundle();
		let mut log = distributed(&bundle.transfers()[0]);
		log.topics.pop();
		let shell = block(40, B256::ZERO, vec![B256::repeat_byte(9)]);
		let r = receipt(&shell, B256::repeat_byte(9), 0, vec![log]);

		assert!(matches!(
			policy().from_receipt(&r),
			Err(PolicyError::TopicCount {
				expected: 4,
				actual: 3,
				..
			})
		));
	}

	#[test]
	fn test_oversized_amount_is_rejected() {
		let bundle = sample_bundle();
		let mut log = distributed(&bundle.transfers()[0]);
		log.topics[3] = B256::from(U256::from(1u8) << 128);
		let shell = block(40, B256::ZERO, vec![B256::repeat_byte(9)]);
		let r = receipt(&shell, B256::repeat_byte(9), 0, vec![log, processed(&bundle)]);

		assert!(matches!(
			policy().from_receipt(&r),
			Err(PolicyError::MalformedPayout { .. })
		));
	}

	#[test]
	fn test_processed_hash_must_match_paid_transfers() {
		let bundle = sample_bundle();
		let mut logs: Vec<Log> = bundle.transfers().iter().map(distributed).collect();
		let mut closing = processed(&bundle);
		closing.topics[2] = B256::repeat_byte(0x66);
		logs.push(closing);
		let shell = block(40, B256::ZERO, vec![B256::repeat_byte(9)]);
		let r = receipt(&shell, B256::repeat_byte(9), 0, logs);

		assert!(matches!(
			policy().from_receipt(&r),
			Err(PolicyError::MalformedPayout { .. })
		));
	}

	#[test]
	fn test_foreign_logs_are_ignored() {
		let bundle = sample_bundle();
		let mut foreign = processed(&bundle);
		foreign.address = Address::repeat_byte(0xcc);
		let unknown = Log {
			address: contract(),
			data: Bytes::new(),
			topics: vec![B256::repeat_byte(0xee)],
		};
		let shell = block(40, B256::ZERO, vec![B256::repeat_byte(9)]);
		let r = receipt(&shell, B256::repeat_byte(9), 0, vec![foreign, unknown]);

		assert!(policy().from_receipt(&r).unwrap().is_empty());
	}
}
