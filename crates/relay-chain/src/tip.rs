//! Agreed chain height.

use crate::{ChainConnection, ChainError, QuorumAggregator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Largest spread of heights, in blocks, that still counts as agreement.
pub const MAX_ACCEPTED_RANGE: u64 = 8;

/// Default deadline for one height collection round.
pub const DEFAULT_TIP_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Tracks the chain tip as reported by a cluster of nodes.
///
/// Heights from all nodes are collected, sorted, and scanned with a window
/// of `quorum` consecutive values. The lowest window whose spread is within
/// [`MAX_ACCEPTED_RANGE`] yields its minimum as the candidate. The tracked
/// height only ever moves forward.
pub struct BlockNumberCollector {
	aggregator: QuorumAggregator<dyn ChainConnection>,
	timeout: Duration,
	/// Height plus one; zero means no height has been recorded yet.
	latest: AtomicU64,
}

impl BlockNumberCollector {
	pub fn new(
		connections: Vec<Arc<dyn ChainConnection>>,
		quorum: usize,
		timeout: Duration,
	) -> Result<Self, ChainError> {
		if timeout.is_zero() {
			tracing::warn!("Tip collection timeout is zero, collection rounds will not time out");
		}
		Ok(Self {
			aggregator: QuorumAggregator::new(connections, quorum)?,
			timeout,
			latest: AtomicU64::new(0),
		})
	}

	pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
		self.aggregator = self.aggregator.with_limiter(limiter);
		self
	}

	/// Starts from a known height instead of "unknown".
	pub fn with_floor(self, height: u64) -> Self {
		self.latest.store(height.saturating_add(1), Ordering::SeqCst);
		self
	}

	/// Height recorded so far, without querying any node.
	pub fn current(&self) -> Option<u64> {
		self.latest.load(Ordering::SeqCst).checked_sub(1)
	}

	/// Runs one collection round and returns the tracked height.
	///
	/// A round without an agreeing cluster leaves the height unchanged, so
	/// the result may be stale. `Ok(None)` means no height was ever agreed.
	/// Quorum failures are returned as errors.
	pub async fn latest_block_number(&self) -> Result<Option<u64>, ChainError> {
		let mut heights = self
			.aggregator
			.collect_all(self.timeout, |c| async move { c.get_block_number().await })
			.await?;

		match select_height(&mut heights, self.aggregator.quorum()) {
			Some(candidate) => {
				let previous = self
					.latest
					.fetch_max(candidate.saturating_add(1), Ordering::SeqCst);
				if previous <= candidate {
					tracing::debug!(height = candidate, "Found new latest block number");
				}
			},
			None => {
				tracing::warn!(
					heights = ?heights,
					max_range = MAX_ACCEPTED_RANGE,
					"Range in block numbers exceeds the accepted range"
				);
			},
		}
		Ok(self.current())
	}
}

/// Picks the minimum of the lowest window of `quorum` sorted heights whose
/// spread is within [`MAX_ACCEPTED_RANGE`].
pub fn select_height(heights: &mut [u64], quorum: usize) -> Option<u64> {
	if quorum == 0 {
		return None;
	}
	heights.sort_unstable();
	heights
		.windows(quorum)
		.find(|window| window[quorum - 1] - window[0] <= MAX_ACCEPTED_RANGE)
		.map(|window| window[0])
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MockConnection;

	fn nodes(heights: &[Option<u64>]) -> Vec<Arc<MockConnection>> {
		heights
			.iter()
			.enumerate()
			.map(|(i, height)| {
				let conn = MockConnection::new(format!("node-{}", i));
				match height {
					Some(h) => conn.set_block_number(*h),
					None => conn.set_failing(true),
				}
				Arc::new(conn)
			})
			.collect()
	}

	fn collector(nodes: &[Arc<MockConnection>], quorum: usize) -> BlockNumberCollector {
		let connections = nodes
			.iter()
			.map(|n| n.clone() as Arc<dyn ChainConnection>)
			.collect();
		BlockNumberCollector::new(connections, quorum, DEFAULT_TIP_TIMEOUT).unwrap()
	}

	#[test]
	fn test_select_height_skips_outlier() {
		let mut heights = vec![100, 101, 109, 102, 103];
		assert_eq!(select_height(&mut heights, 3), Some(100));
	}

	#[test]
	fn test_select_height_prefers_lowest_tight_window() {
		let mut heights = vec![10, 50, 51, 52, 200];
		assert_eq!(select_height(&mut heights, 3), Some(50));

		let mut spread = vec![0, 20, 40];
		assert_eq!(select_height(&mut spread, 2), None);

		let mut edge = vec![100, 108];
		assert_eq!(select_height(&mut edge, 2), Some(100));
	}

	#[tokio::test]
	async fn test_unknown_until_first_agreement() {
		let nodes = nodes(&[Some(0), Some(50), Some(100)]);
		let tip = collector(&nodes, 2);
		assert_eq!(tip.current(), None);
		assert_eq!(tip.latest_block_number().await.unwrap(), None);

		nodes[1].set_block_number(2);
		assert_eq!(tip.latest_block_number().await.unwrap(), Some(0));
	}

	#[tokio::test]
	async fn test_height_never_moves_backward() {
		let nodes = nodes(&[Some(100), Some(101), Some(102)]);
		let tip = collector(&nodes, 2);
		assert_eq!(tip.latest_block_number().await.unwrap(), Some(100));

		for node in &nodes {
			node.set_block_number(90);
		}
		assert_eq!(tip.latest_block_number().await.unwrap(), Some(100));

		for node in &nodes {
			node.set_block_number(120);
		}
		assert_eq!(tip.latest_block_number().await.unwrap(), Some(120));
	}

	#[tokio::test]
	async fn test_quorum_failure_is_an_error() {
		let nodes = nodes(&[Some(100), None, None]);
		let tip = collector(&nodes, 2).with_floor(7);
		assert!(matches!(
			tip.latest_block_number().await,
			Err(ChainError::QuorumNotAvailable { responses: 1, .. })
		));
		assert_eq!(tip.current(), Some(7));
	}
}
