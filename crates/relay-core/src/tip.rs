//! Chain tip tracking task.
//!
//! Polls a [`BlockNumberCollector`] and publishes the agreed height to the
//! workers over a watch channel. The published value is `None` until the
//! first height is agreed.

use crate::CriticalError;
use relay_chain::{BlockNumberCollector, ChainError};
use relay_storage::{StorageError, StorageService};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Consecutive failed rounds tolerated before the tip is declared lost.
pub const MAX_CONSECUTIVE_ERR: usize = 5;

const WORKER: &str = "tip";

/// Reasons a tip round did not produce a height.
#[derive(Debug, Error)]
pub enum TipError {
	#[error("No height agreed yet")]
	Unknown,
	#[error(transparent)]
	Chain(#[from] ChainError),
	/// The height was published but could not be written down.
	#[error("Failed to persist tip: {0}")]
	Persist(#[from] StorageError),
}

/// Publishes the tip of one chain.
pub struct TipState {
	chain: String,
	collector: Arc<BlockNumberCollector>,
	poll_interval: Duration,
	shutdown_on_error: bool,
	storage: Option<Arc<StorageService>>,
	sender: watch::Sender<Option<u64>>,
}

impl TipState {
	pub fn new(
		chain: impl Into<String>,
		collector: Arc<BlockNumberCollector>,
		poll_interval: Duration,
		shutdown_on_error: bool,
	) -> Self {
		let (sender, _) = watch::channel(collector.current());
		Self {
			chain: chain.into(),
			collector,
			poll_interval,
			shutdown_on_error,
			storage: None,
			sender,
		}
	}

	/// Persists every new height under the chain name.
	pub fn with_storage(mut self, storage: Arc<StorageService>) -> Self {
		self.storage = Some(storage);
		self
	}

	pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
		self.sender.subscribe()
	}

	/// Runs one collection round and publishes the result.
	///
	/// Fails when the round failed, no height has ever been agreed, or a new
	/// height could not be persisted.
	pub async fn poll_once(&self) -> Result<u64, TipError> {
		let height = self.collector.latest_block_number().await?.ok_or(TipError::Unknown)?;

		let current = *self.sender.borrow();
		if current != Some(height) {
			if let Some(storage) = &self.storage {
				storage.store_tip(&self.chain, height).await?;
			}
			self.sender.send_replace(Some(height));
			tracing::trace!(chain = %self.chain, height, "Tip advanced");
		}
		Ok(height)
	}

	/// Polls until cancelled.
	///
	/// With `shutdown_on_error`, [`MAX_CONSECUTIVE_ERR`] failed rounds in a
	/// row are critical. Otherwise failures are only logged. A tip that
	/// cannot be persisted is always critical.
	pub async fn run(self, cancel: CancellationToken) -> Result<(), CriticalError> {
		let mut consecutive_errors = 0usize;
		loop {
			let round = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				round = self.poll_once() => round,
			};

			match round {
				Ok(_) => consecutive_errors = 0,
				Err(e @ TipError::Persist(_)) => {
					return Err(CriticalError::new(WORKER, format!("Tip of {}: {}", self.chain, e)));
				},
				Err(e) if self.shutdown_on_error => {
					consecutive_errors += 1;
					tracing::warn!(
						chain = %self.chain,
						error = %e,
						consecutive_errors,
						"Failed to update tip"
					);
					if consecutive_errors >= MAX_CONSECUTIVE_ERR {
						return Err(CriticalError::new(
							WORKER,
							format!(
								"Tip of {} unavailable for {} consecutive rounds: {}",
								self.chain, consecutive_errors, e
							),
						));
					}
				},
				Err(e) => {
					tracing::warn!(chain = %self.chain, error = %e, "Failed to update tip");
				},
			}

			tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				_ = tokio::time::sleep(self.poll_interval) => {},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use relay_chain::testing::MockConnection;
	use relay_chain::ChainConnection;
	use relay_storage::implementations::memory::{MemoryStorage, MemoryStorageSchema};
	use relay_storage::StorageInterface;
	use relay_types::ConfigSchema;

	/// Backend whose writes always fail.
	struct ReadOnlyStorage;

	#[async_trait]
	impl StorageInterface for ReadOnlyStorage {
		async fn get_bytes(&self, _key: &str) -> Result<Vec<u8>, StorageError> {
			Err(StorageError::NotFound)
		}

		async fn set_bytes(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), StorageError> {
			Err(StorageError::Backend("disk full".into()))
		}

		async fn delete(&self, _key: &str) -> Result<(), StorageError> {
			Ok(())
		}

		async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
			Ok(false)
		}

		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(MemoryStorageSchema)
		}
	}

	fn tip_state(heights: &[u64], quorum: usize, shutdown_on_error: bool) -> (TipState, Vec<Arc<MockConnection>>) {
		let mocks: Vec<Arc<MockConnection>> = heights
			.iter()
			.enumerate()
			.map(|(i, h)| {
				let m = Arc::new(MockConnection::new(format!("node-{}", i)));
				m.set_block_number(*h);
				m
			})
			.collect();
		let conns = mocks
			.iter()
			.map(|m| m.clone() as Arc<dyn ChainConnection>)
			.collect();
		let collector = BlockNumberCollector::new(conns, quorum, Duration::from_millis(100)).unwrap();
		(
			TipState::new("dest", Arc::new(collector), Duration::from_millis(10), shutdown_on_error),
			mocks,
		)
	}

	#[tokio::test]
	async fn test_poll_publishes_agreed_height() {
		let (tip, _mocks) = tip_state(&[100, 101, 109, 102, 103], 3, true);
		let mut rx = tip.subscribe();
		assert_eq!(*rx.borrow(), None);

		assert_eq!(tip.poll_once().await.unwrap(), 100);
		assert!(rx.has_changed().unwrap());
		assert_eq!(*rx.borrow_and_update(), Some(100));
	}

	#[tokio::test]
	async fn test_new_heights_are_persisted() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let (tip, mocks) = tip_state(&[50], 1, true);
		let tip = tip.with_storage(storage.clone());

		tip.poll_once().await.unwrap();
		assert_eq!(storage.load_tip("dest").await.unwrap(), Some(50));
		mocks[0].set_block_number(51);
		tip.poll_once().await.unwrap();
		assert_eq!(storage.load_tip("dest").await.unwrap(), Some(51));
	}

	#[tokio::test]
	async fn test_unknown_height_is_reported() {
		let (tip, mocks) = tip_state(&[10], 1, true);
		mocks[0].set_failing(true);
		assert!(matches!(tip.poll_once().await, Err(TipError::Chain(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn test_persist_failure_is_critical_without_shutdown_flag() {
		let storage = Arc::new(StorageService::new(Box::new(ReadOnlyStorage)));
		let (tip, _mocks) = tip_state(&[50], 1, false);
		let tip = tip.with_storage(storage);

		assert!(matches!(tip.poll_once().await, Err(TipError::Persist(_))));
		let err = tip.run(CancellationToken::new()).await.unwrap_err();
		assert_eq!(err.worker, "tip");
		assert!(err.message.contains("persist"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_consecutive_failures_are_critical() {
		let (tip, mocks) = tip_state(&[10, 10], 2, true);
		mocks[1].set_failing(true);

		let err = tip.run(CancellationToken::new()).await.unwrap_err();
		assert_eq!(err.worker, "tip");
	}

	#[tokio::test(start_paused = true)]
	async fn test_failures_only_warn_without_shutdown_flag() {
		let (tip, mocks) = tip_state(&[10, 10], 2, false);
		mocks[1].set_failing(true);
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(tip.run(cancel.clone()));

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert!(!handle.is_finished());
		cancel.cancel();
		assert!(handle.await.unwrap().is_ok());
	}
}
