//! Chain access for the bridge relay.
//!
//! A [`ChainConnection`] talks to exactly one node and never retries. Nodes
//! are individually untrusted, so every answer the relay acts on goes through
//! a [`QuorumAggregator`]: either [`ConsolidatedChainConnection`], which
//! requires byte-identical agreement, or [`BlockNumberCollector`], which
//! accepts a tight cluster of tip heights.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use relay_types::{
	Address, Block, BlockTag, BlockWithReceipts, Bytes, ConfigSchema, Receipt, B256, U256,
};
use thiserror::Error;

pub mod consolidated;
pub mod processor;
pub mod quorum;
pub mod tip;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export implementations
pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
}

pub use consolidated::ConsolidatedChainConnection;
pub use quorum::QuorumAggregator;
pub use tip::BlockNumberCollector;

/// Receipt requests a single connection keeps in flight while fetching the
/// receipts of a block.
pub const MAX_RECEIPT_REQUESTS: usize = 16;

/// Errors surfaced by chain access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
	/// The node could not be reached or did not answer.
	#[error("Incomplete API call: {0}")]
	IncompleteApiCall(String),
	/// The node answered with something that cannot be interpreted.
	#[error("Malformed API response: {0}")]
	MalformedApiResponse(String),
	/// Too few sources answered, or agreed, before the deadline.
	#[error(
		"Could not achieve quorum: {responses} responses received, {cancelled} cancelled requests, quorum {quorum}"
	)]
	QuorumNotAvailable {
		responses: usize,
		cancelled: usize,
		quorum: usize,
	},
	/// A receipt set does not exactly cover the transactions of its block.
	#[error("Missing receipts: {0}")]
	MissingReceipts(String),
	/// The connection does not offer this operation.
	#[error("Unsupported operation: {0}")]
	Unsupported(&'static str),
	#[error("Invalid configuration: {0}")]
	InvalidConfiguration(String),
}

impl ChainError {
	/// Whether a later attempt of the same call may succeed.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			ChainError::IncompleteApiCall(_)
				| ChainError::MalformedApiResponse(_)
				| ChainError::QuorumNotAvailable { .. }
		)
	}
}

/// Point-to-point client for a single chain node.
///
/// Absence (`Ok(None)`) and failure (`Err`) are distinct: a block or receipt
/// the node does not know is not an error.
#[async_trait]
pub trait ChainConnection: Send + Sync {
	/// Label used in logs, usually the endpoint.
	fn name(&self) -> &str;

	async fn get_block_number(&self) -> Result<u64, ChainError>;

	async fn get_block(&self, number: u64) -> Result<Option<Block>, ChainError>;

	/// Fetches every block in `start..=end`. A block the node cannot serve
	/// fails the whole range.
	async fn get_blocks_range_closed(&self, start: u64, end: u64) -> Result<Vec<Block>, ChainError> {
		let mut blocks = Vec::with_capacity(end.saturating_sub(start) as usize + 1);
		for number in start..=end {
			let block = self.get_block(number).await?.ok_or_else(|| {
				ChainError::IncompleteApiCall(format!("Block {} not available", number))
			})?;
			blocks.push(block);
		}
		Ok(blocks)
	}

	async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError>;

	/// Fetches all receipts of every block, at most [`MAX_RECEIPT_REQUESTS`]
	/// at a time. Fails with [`ChainError::MissingReceipts`] if any block's
	/// receipts are incomplete.
	async fn get_receipts_for_blocks(
		&self,
		blocks: &[Block],
	) -> Result<Vec<BlockWithReceipts>, ChainError> {
		let mut out = Vec::with_capacity(blocks.len());
		for block in blocks {
			let receipts: Vec<Option<Receipt>> = stream::iter(
				block
					.transaction_hashes
					.iter()
					.copied()
					.map(|hash| self.get_receipt(hash)),
			)
			.buffered(MAX_RECEIPT_REQUESTS)
			.try_collect()
			.await?;

			let mut complete = Vec::with_capacity(receipts.len());
			for (hash, receipt) in block.transaction_hashes.iter().zip(receipts) {
				let receipt = receipt.ok_or_else(|| {
					ChainError::MissingReceipts(format!(
						"No receipt for transaction {} in block {}",
						hash, block.number
					))
				})?;
				complete.push(receipt);
			}
			processor::verify_receipts(block, &complete)?;
			out.push(BlockWithReceipts {
				block: block.clone(),
				receipts: complete,
			});
		}
		Ok(out)
	}

	/// Executes a read-only call and returns the raw return data.
	async fn contract_call(&self, to: Address, data: Bytes, tag: BlockTag) -> Result<Bytes, ChainError>;

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError>;

	async fn get_nonce(&self, address: Address) -> Result<u64, ChainError>;

	async fn get_gas_price(&self) -> Result<u128, ChainError>;

	/// Broadcasts a signed transaction, returning its hash.
	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError>;

	async fn peer_count(&self) -> Result<u64, ChainError> {
		Err(ChainError::Unsupported("peer_count"))
	}

	/// Drops pooled transport connections. Requests already in flight finish
	/// on the connections they hold.
	fn evict_connections(&self);
}

/// Type alias for chain connection factory functions.
pub type ConnectionFactory = fn(&toml::Value) -> Result<Box<dyn ChainConnection>, ChainError>;

/// Returns every connection implementation as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, ConnectionFactory)> {
	use implementations::evm::alloy;
	use relay_types::ImplementationRegistry;

	vec![(alloy::Registry::NAME, alloy::Registry::factory())]
}

/// Validates an endpoint table against an implementation's schema, mapping
/// failures to [`ChainError::InvalidConfiguration`].
pub(crate) fn validate_endpoint(schema: &dyn ConfigSchema, config: &toml::Value) -> Result<(), ChainError> {
	schema
		.validate(config)
		.map_err(|e| ChainError::InvalidConfiguration(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{block, receipt, MockConnection};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn test_default_range_fails_on_gap() {
		let conn = MockConnection::new("a");
		conn.push_block(block(1, B256::ZERO, vec![]));
		conn.push_block(block(3, B256::ZERO, vec![]));

		let err = conn.get_blocks_range_closed(1, 3).await.unwrap_err();
		assert!(matches!(err, ChainError::IncompleteApiCall(msg) if msg.contains("Block 2")));
	}

	#[tokio::test]
	async fn test_default_receipts_for_blocks() {
		let conn = MockConnection::new("a");
		let tx1 = B256::repeat_byte(1);
		let tx2 = B256::repeat_byte(2);
		let b = block(7, B256::ZERO, vec![tx1, tx2]);
		conn.insert_receipt(receipt(&b, tx1, 0, vec![]));

		let err = conn.get_receipts_for_blocks(&[b.clone()]).await.unwrap_err();
		assert!(matches!(err, ChainError::MissingReceipts(_)));

		conn.insert_receipt(receipt(&b, tx2, 1, vec![]));
		let out = conn.get_receipts_for_blocks(&[b]).await.unwrap();
		assert_eq!(out[0].receipts.len(), 2);
		assert_eq!(out[0].receipts[1].transaction_hash, tx2);
	}

	/// Answers receipt requests after a delay, recording how many overlap.
	struct SlowReceipts {
		block: Block,
		in_flight: AtomicUsize,
		peak: AtomicUsize,
	}

	#[async_trait]
	impl ChainConnection for SlowReceipts {
		fn name(&self) -> &str {
			"slow"
		}

		async fn get_block_number(&self) -> Result<u64, ChainError> {
			Ok(self.block.number)
		}

		async fn get_block(&self, _number: u64) -> Result<Option<Block>, ChainError> {
			Ok(Some(self.block.clone()))
		}

		async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError> {
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(10)).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			let index = self
				.block
				.transaction_hashes
				.iter()
				.position(|h| *h == tx_hash);
			Ok(index.map(|i| receipt(&self.block, tx_hash, i as u32, vec![])))
		}

		async fn contract_call(&self, _to: Address, _data: Bytes, _tag: BlockTag) -> Result<Bytes, ChainError> {
			Err(ChainError::Unsupported("contract_call"))
		}

		async fn get_balance(&self, _address: Address, _tag: BlockTag) -> Result<U256, ChainError> {
			Err(ChainError::Unsupported("get_balance"))
		}

		async fn get_nonce(&self, _address: Address) -> Result<u64, ChainError> {
			Err(ChainError::Unsupported("get_nonce"))
		}

		async fn get_gas_price(&self) -> Result<u128, ChainError> {
			Err(ChainError::Unsupported("get_gas_price"))
		}

		async fn send_raw_transaction(&self, _raw: Bytes) -> Result<B256, ChainError> {
			Err(ChainError::Unsupported("send_raw_transaction"))
		}

		fn evict_connections(&self) {}
	}

	#[tokio::test(start_paused = true)]
	async fn test_receipt_requests_are_bounded() {
		let hashes: Vec<B256> = (0..100u64).map(|i| B256::from(U256::from(i + 1))).collect();
		let conn = SlowReceipts {
			block: block(9, B256::ZERO, hashes.clone()),
			in_flight: AtomicUsize::new(0),
			peak: AtomicUsize::new(0),
		};

		let out = conn.get_receipts_for_blocks(&[conn.block.clone()]).await.unwrap();
		assert_eq!(out[0].receipts.len(), 100);
		assert_eq!(out[0].receipts[42].transaction_hash, hashes[42]);
		assert_eq!(conn.peak.load(Ordering::SeqCst), MAX_RECEIPT_REQUESTS);
		assert_eq!(conn.in_flight.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn test_transient_classification() {
		assert!(ChainError::IncompleteApiCall("x".into()).is_transient());
		assert!(ChainError::QuorumNotAvailable {
			responses: 0,
			cancelled: 0,
			quorum: 1
		}
		.is_transient());
		assert!(!ChainError::MissingReceipts("x".into()).is_transient());
		assert!(!ChainError::Unsupported("x").is_transient());
	}
}
