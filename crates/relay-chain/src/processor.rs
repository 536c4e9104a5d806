//! Block and receipt filtering.
//!
//! Blooms only say "maybe". A bloom hit is always confirmed against the
//! emitting address and the first topic before a log is kept.

use crate::ChainError;
use relay_types::{Block, EventFilter, Receipt, B256};
use std::collections::HashSet;

/// Cheap pre-filter: true when the block may contain a matching log.
pub fn filter_block(block: &Block, filter: &EventFilter) -> bool {
	filter.matches(&block.logs_bloom)
}

/// Checks that `receipts` are exactly the receipts of `block`: every receipt
/// belongs to one of its transactions and no transaction is left uncovered.
pub fn verify_receipts(block: &Block, receipts: &[Receipt]) -> Result<(), ChainError> {
	let mut expected: HashSet<&B256> = block.transaction_hashes.iter().collect();

	for receipt in receipts {
		if !expected.remove(&receipt.transaction_hash) {
			return Err(ChainError::MissingReceipts(format!(
				"Receipt for {} does not belong to block {} ({})",
				receipt.transaction_hash, block.number, block.hash
			)));
		}
	}

	if !expected.is_empty() {
		return Err(ChainError::MissingReceipts(format!(
			"{} of {} receipts missing for block {} ({})",
			expected.len(),
			block.transaction_hashes.len(),
			block.number,
			block.hash
		)));
	}
	Ok(())
}

/// Returns the receipts of `block` holding at least one log that matches
/// `filter`, each trimmed to its matching logs.
///
/// Fails with [`ChainError::MissingReceipts`] when the receipt set does not
/// exactly cover the block's transactions.
pub fn filter_receipts(
	block: &Block,
	receipts: &[Receipt],
	filter: &EventFilter,
) -> Result<Vec<Receipt>, ChainError> {
	verify_receipts(block, receipts)?;

	let matched = receipts
		.iter()
		.filter(|receipt| filter.matches(&receipt.logs_bloom))
		.filter_map(|receipt| {
			let logs: Vec<_> = receipt
				.logs
				.iter()
				.filter(|log| filter.matches_log(log))
				.cloned()
				.collect();
			if logs.is_empty() {
				return None;
			}
			Some(Receipt {
				logs,
				..receipt.clone()
			})
		})
		.collect();

	Ok(matched)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{block, receipt};
	use relay_types::{Address, Bloom, Bytes, ChainHasher, Log};

	fn deposit_filter() -> EventFilter {
		EventFilter::new(
			ChainHasher::Keccak256,
			Address::repeat_byte(0xaa),
			"Deposit(bytes32,uint256)",
		)
	}

	fn log_for(filter: &EventFilter) -> Log {
		Log {
			address: *filter.contract_address(),
			data: Bytes::new(),
			topics: vec![*filter.event_hash()],
		}
	}

	#[test]
	fn test_filter_block_uses_bloom() {
		let filter = deposit_filter();
		let mut b = block(1, B256::ZERO, vec![]);
		assert!(!filter_block(&b, &filter));

		b.logs_bloom = *filter.bloom();
		assert!(filter_block(&b, &filter));
	}

	#[test]
	fn test_missing_receipt_is_rejected() {
		let filter = deposit_filter();
		let txs = vec![B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3)];
		let b = block(5, B256::ZERO, txs.clone());
		let receipts = vec![receipt(&b, txs[0], 0, vec![]), receipt(&b, txs[1], 1, vec![])];

		assert!(matches!(
			filter_receipts(&b, &receipts, &filter),
			Err(ChainError::MissingReceipts(msg)) if msg.contains("1 of 3")
		));
	}

	#[test]
	fn test_foreign_receipt_is_rejected() {
		let filter = deposit_filter();
		let b = block(5, B256::ZERO, vec![B256::repeat_byte(1)]);
		let foreign = receipt(&b, B256::repeat_byte(9), 0, vec![]);

		assert!(matches!(
			filter_receipts(&b, &[foreign], &filter),
			Err(ChainError::MissingReceipts(msg)) if msg.contains("does not belong")
		));
	}

	#[test]
	fn test_duplicate_receipt_is_rejected() {
		let tx = B256::repeat_byte(1);
		let b = block(5, B256::ZERO, vec![tx]);
		let r = receipt(&b, tx, 0, vec![]);
		assert!(verify_receipts(&b, &[r.clone(), r]).is_err());
	}

	#[test]
	fn test_bloom_false_positive_is_dropped() {
		let filter = deposit_filter();
		let tx = B256::repeat_byte(1);
		let b = block(5, B256::ZERO, vec![tx]);

		// Bloom claims a match but the only log is from another contract.
		let mut stranger = log_for(&filter);
		stranger.address = Address::repeat_byte(0xcc);
		let mut r = receipt(&b, tx, 0, vec![stranger]);
		r.logs_bloom = *filter.bloom();

		assert!(filter_receipts(&b, &[r], &filter).unwrap().is_empty());
	}

	#[test]
	fn test_matching_receipts_keep_only_matching_logs() {
		let filter = deposit_filter();
		let txs = vec![B256::repeat_byte(1), B256::repeat_byte(2)];
		let b = block(5, B256::ZERO, txs.clone());

		let other = Log {
			address: *filter.contract_address(),
			data: Bytes::new(),
			topics: vec![B256::repeat_byte(0x77)],
		};
		let mut hit = receipt(&b, txs[0], 0, vec![other, log_for(&filter)]);
		hit.logs_bloom = *filter.bloom();
		let miss = receipt(&b, txs[1], 1, vec![]);

		let out = filter_receipts(&b, &[miss, hit], &filter).unwrap();
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].transaction_hash, txs[0]);
		assert_eq!(out[0].logs, vec![log_for(&filter)]);
		assert_ne!(out[0].logs_bloom, Bloom::ZERO);
	}
}
