//! Balance monitor for the account paying destination fees.
//!
//! Reads the balance at the latest destination block, stores it for status
//! queries and raises one alert when it falls below the configured minimum.
//! The alert is raised again only after the balance has recovered in between.

use crate::ALERT_TARGET;
use relay_chain::{ChainConnection, ChainError};
use relay_storage::StorageService;
use relay_types::{Address, BalanceRecord, BlockTag, U256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BalanceError {
	#[error(transparent)]
	Chain(#[from] ChainError),
	#[error("Failed to store balance: {0}")]
	Storage(#[from] relay_storage::StorageError),
}

pub struct BalanceMonitor {
	chain: String,
	connection: Arc<dyn ChainConnection>,
	account: Address,
	storage: Arc<StorageService>,
	min_balance: Option<U256>,
	interval: Duration,
	alerted: bool,
}

impl BalanceMonitor {
	pub fn new(
		chain: impl Into<String>,
		connection: Arc<dyn ChainConnection>,
		account: Address,
		storage: Arc<StorageService>,
		interval: Duration,
	) -> Self {
		Self {
			chain: chain.into(),
			connection,
			account,
			storage,
			min_balance: None,
			interval,
			alerted: false,
		}
	}

	pub fn with_min_balance(mut self, min_balance: Option<U256>) -> Self {
		self.min_balance = min_balance;
		self
	}

	/// Reads, stores and checks the balance once.
	pub async fn check_once(&mut self) -> Result<BalanceRecord, BalanceError> {
		let block_number = self.connection.get_block_number().await?;
		let balance = self
			.connection
			.get_balance(self.account, BlockTag::Number(block_number))
			.await?;
		let record = BalanceRecord {
			account: self.account,
			balance,
			block_number,
		};
		self.storage.store_balance(&self.chain, &record).await?;

		match self.min_balance {
			Some(min) if balance < min => {
				if !self.alerted {
					tracing::error!(
						target: ALERT_TARGET,
						chain = %self.chain,
						account = %self.account,
						%balance,
						%min,
						"Relayer balance low"
					);
					self.alerted = true;
				}
			},
			_ => {
				if self.alerted {
					tracing::info!(chain = %self.chain, account = %self.account, %balance, "Relayer balance recovered");
				}
				self.alerted = false;
			},
		}
		Ok(record)
	}

	/// Whether the last read was below the minimum.
	pub fn is_low(&self) -> bool {
		self.alerted
	}

	/// Polls until cancelled. Failed reads are logged and retried on the next
	/// tick.
	pub async fn run(mut self, cancel: CancellationToken) {
		let mut interval = tokio::time::interval(self.interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = interval.tick() => {},
			}
			if let Err(e) = self.check_once().await {
				tracing::warn!(chain = %self.chain, error = %e, "Balance check failed");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_chain::testing::MockConnection;
	use relay_storage::implementations::memory::MemoryStorage;

	fn monitor(conn: Arc<MockConnection>, storage: Arc<StorageService>) -> BalanceMonitor {
		BalanceMonitor::new(
			"destination",
			conn,
			Address::repeat_byte(0x0b),
			storage,
			Duration::from_secs(60),
		)
		.with_min_balance(Some(U256::from(100u64)))
	}

	#[tokio::test]
	async fn test_balance_is_stored_with_its_block() {
		let conn = Arc::new(MockConnection::new("destination"));
		conn.set_block_number(42);
		conn.set_balance(U256::from(500u64));
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));

		let record = monitor(conn, storage.clone()).check_once().await.unwrap();
		assert_eq!(record.block_number, 42);
		assert_eq!(record.balance, U256::from(500u64));
		assert_eq!(storage.load_balance("destination").await.unwrap(), Some(record));
	}

	#[tokio::test]
	async fn test_low_balance_alert_resets_after_recovery() {
		let conn = Arc::new(MockConnection::new("destination"));
		conn.set_block_number(1);
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut monitor = monitor(conn.clone(), storage);

		conn.set_balance(U256::from(99u64));
		monitor.check_once().await.unwrap();
		assert!(monitor.is_low());
		monitor.check_once().await.unwrap();
		assert!(monitor.is_low());

		conn.set_balance(U256::from(100u64));
		monitor.check_once().await.unwrap();
		assert!(!monitor.is_low());
	}

	#[tokio::test]
	async fn test_without_minimum_never_low() {
		let conn = Arc::new(MockConnection::new("destination"));
		conn.set_block_number(1);
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut monitor = monitor(conn, storage).with_min_balance(None);
		monitor.check_once().await.unwrap();
		assert!(!monitor.is_low());
	}

	#[tokio::test]
	async fn test_unreachable_node_stores_nothing() {
		let conn = Arc::new(MockConnection::new("destination"));
		conn.set_failing(true);
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut monitor = monitor(conn, storage.clone());
		assert!(matches!(monitor.check_once().await, Err(BalanceError::Chain(_))));
		assert!(storage.load_balance("destination").await.unwrap().is_none());
	}
}
