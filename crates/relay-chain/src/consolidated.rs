//! A chain connection backed by a quorum of nodes.

use crate::{ChainConnection, ChainError, QuorumAggregator};
use async_trait::async_trait;
use relay_types::{Address, Block, BlockTag, BlockWithReceipts, Bytes, Receipt, B256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default deadline for a consolidated call.
pub const DEFAULT_CONSOLIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers every call with the value byte-identically reported by `quorum`
/// of its connections.
pub struct ConsolidatedChainConnection {
	name: String,
	aggregator: QuorumAggregator<dyn ChainConnection>,
	timeout: Duration,
}

impl ConsolidatedChainConnection {
	pub fn new(
		name: impl Into<String>,
		connections: Vec<Arc<dyn ChainConnection>>,
		quorum: usize,
		timeout: Duration,
	) -> Result<Self, ChainError> {
		let name = name.into();
		if timeout.is_zero() {
			tracing::warn!(chain = %name, "Consolidation timeout is zero, calls will not time out");
		}
		Ok(Self {
			name,
			aggregator: QuorumAggregator::new(connections, quorum)?,
			timeout,
		})
	}

	pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
		self.aggregator = self.aggregator.with_limiter(limiter);
		self
	}

	/// The individual node connections.
	pub fn connections(&self) -> &[Arc<dyn ChainConnection>] {
		self.aggregator.sources()
	}

	pub fn quorum(&self) -> usize {
		self.aggregator.quorum()
	}
}

#[async_trait]
impl ChainConnection for ConsolidatedChainConnection {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_block_number(&self) -> Result<u64, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_block_number().await })
			.await
	}

	async fn get_block(&self, number: u64) -> Result<Option<Block>, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_block(number).await })
			.await
	}

	async fn get_blocks_range_closed(&self, start: u64, end: u64) -> Result<Vec<Block>, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move {
				c.get_blocks_range_closed(start, end).await
			})
			.await
	}

	async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_receipt(tx_hash).await })
			.await
	}

	async fn get_receipts_for_blocks(
		&self,
		blocks: &[Block],
	) -> Result<Vec<BlockWithReceipts>, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move {
				c.get_receipts_for_blocks(blocks).await
			})
			.await
	}

	async fn contract_call(&self, to: Address, data: Bytes, tag: BlockTag) -> Result<Bytes, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| {
				let data = data.clone();
				async move { c.contract_call(to, data, tag).await }
			})
			.await
	}

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_balance(address, tag).await })
			.await
	}

	async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_nonce(address).await })
			.await
	}

	async fn get_gas_price(&self) -> Result<u128, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| async move { c.get_gas_price().await })
			.await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
		self.aggregator
			.consolidate(self.timeout, |c| {
				let raw = raw.clone();
				async move { c.send_raw_transaction(raw).await }
			})
			.await
	}

	async fn peer_count(&self) -> Result<u64, ChainError> {
		Err(ChainError::Unsupported("peer_count"))
	}

	fn evict_connections(&self) {
		for connection in self.aggregator.sources() {
			connection.evict_connections();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{block, MockConnection};

	fn consolidated(nodes: &[Arc<MockConnection>], quorum: usize) -> ConsolidatedChainConnection {
		let connections = nodes
			.iter()
			.map(|n| n.clone() as Arc<dyn ChainConnection>)
			.collect();
		ConsolidatedChainConnection::new("test", connections, quorum, DEFAULT_CONSOLIDATION_TIMEOUT)
			.unwrap()
	}

	fn nodes(n: usize) -> Vec<Arc<MockConnection>> {
		(0..n)
			.map(|i| Arc::new(MockConnection::new(format!("node-{}", i))))
			.collect()
	}

	#[tokio::test]
	async fn test_forked_minority_is_outvoted() {
		let nodes = nodes(3);
		let canonical = block(10, B256::ZERO, vec![]);
		let mut forked = canonical.clone();
		forked.hash = B256::repeat_byte(0xee);

		nodes[0].push_block(canonical.clone());
		nodes[1].push_block(forked);
		nodes[2].push_block(canonical.clone());

		let conn = consolidated(&nodes, 2);
		assert_eq!(conn.get_block(10).await.unwrap(), Some(canonical));
	}

	#[tokio::test]
	async fn test_agreed_absence_is_not_an_error() {
		let nodes = nodes(3);
		let conn = consolidated(&nodes, 2);
		assert_eq!(conn.get_receipt(B256::repeat_byte(1)).await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_contract_call_needs_agreement() {
		let nodes = nodes(3);
		let data = Bytes::from(vec![1, 2, 3]);
		nodes[0].set_call_result(data.clone(), Bytes::from(vec![9]));
		nodes[1].set_call_result(data.clone(), Bytes::from(vec![8]));
		nodes[2].set_failing(true);

		let conn = consolidated(&nodes, 2);
		assert!(matches!(
			conn.contract_call(Address::ZERO, data.clone(), BlockTag::Latest).await,
			Err(ChainError::QuorumNotAvailable { responses: 2, .. })
		));

		nodes[2].set_failing(false);
		nodes[2].set_call_result(data.clone(), Bytes::from(vec![9]));
		assert_eq!(
			conn.contract_call(Address::ZERO, data, BlockTag::Latest)
				.await
				.unwrap(),
			Bytes::from(vec![9])
		);
	}

	#[tokio::test]
	async fn test_evict_and_peer_count() {
		let nodes = nodes(2);
		let conn = consolidated(&nodes, 1);
		conn.evict_connections();
		assert!(nodes.iter().all(|n| n.eviction_count() == 1));
		assert_eq!(
			conn.peer_count().await,
			Err(ChainError::Unsupported("peer_count"))
		);
	}
}
