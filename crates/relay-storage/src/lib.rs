//! Persistence for the bridge relay.
//!
//! Bundles are stored under monotonically increasing ids together with a
//! handful of progress markers: the next id to assign, the last finalized
//! id and the source checkpoint. An index from source transaction to bundle
//! id and the last observed relayer balance serve status queries. Backends
//! only deal in bytes; this crate's [`StorageService`] adds the typed relay
//! operations on top.

use async_trait::async_trait;
use relay_types::{
	BalanceRecord, ChainLink, ConfigSchema, ImplementationRegistry, StatefulBundle, StorageKey, B256,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level key-value interface for storage backends.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes with optional time-to-live.
	async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a key exists in storage.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries and returns how many were removed.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

const NEXT_BUNDLE_ID: &str = "next_bundle_id";
const LAST_FINALIZED: &str = "last_finalized";
const SOURCE_CHECKPOINT: &str = "source";

/// Bundle ids start at 1 so that "nothing finalized yet" can be 0.
pub const FIRST_BUNDLE_ID: u64 = 1;

/// Typed relay persistence over a storage backend.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: StorageKey, id: &str) -> String {
		format!("{}:{}", namespace.as_str(), id)
	}

	/// Zero padded so that keys sort in id order.
	fn bundle_key(bundle_id: u64) -> String {
		Self::key(StorageKey::Bundles, &format!("{:020}", bundle_id))
	}

	/// Stores a serializable value under `namespace:id`.
	pub async fn store<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let bytes = serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.set_bytes(&Self::key(namespace, id), bytes, None)
			.await
	}

	/// Retrieves a value, `None` when the key does not exist.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: StorageKey,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.backend.get_bytes(&Self::key(namespace, id)).await {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|e| StorageError::Serialization(e.to_string())),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Writes the bundle in its current state, replacing any earlier version.
	pub async fn store_bundle(&self, bundle: &StatefulBundle) -> Result<(), StorageError> {
		let bytes = serde_json::to_vec(bundle).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.set_bytes(&Self::bundle_key(bundle.id()), bytes, None)
			.await?;
		tracing::trace!(bundle_id = bundle.id(), state = %bundle.state(), "Stored bundle");
		Ok(())
	}

	pub async fn load_bundle(&self, bundle_id: u64) -> Result<Option<StatefulBundle>, StorageError> {
		match self.backend.get_bytes(&Self::bundle_key(bundle_id)).await {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|e| StorageError::Serialization(e.to_string())),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Loads bundles with ids in `[from, to)`, in id order.
	///
	/// Every id in the range must exist: ids are assigned without gaps, so a
	/// hole means the store lost data.
	pub async fn load_bundles(&self, from: u64, to: u64) -> Result<Vec<StatefulBundle>, StorageError> {
		let mut bundles = Vec::with_capacity(to.saturating_sub(from) as usize);
		for bundle_id in from..to {
			let bundle = self
				.load_bundle(bundle_id)
				.await?
				.ok_or_else(|| StorageError::Backend(format!("Bundle {} missing from store", bundle_id)))?;
			bundles.push(bundle);
		}
		Ok(bundles)
	}

	/// Next id to assign, [`FIRST_BUNDLE_ID`] on an empty store.
	pub async fn next_bundle_id(&self) -> Result<u64, StorageError> {
		Ok(self
			.retrieve(StorageKey::Checkpoints, NEXT_BUNDLE_ID)
			.await?
			.unwrap_or(FIRST_BUNDLE_ID))
	}

	pub async fn set_next_bundle_id(&self, bundle_id: u64) -> Result<(), StorageError> {
		self.store(StorageKey::Checkpoints, NEXT_BUNDLE_ID, &bundle_id)
			.await
	}

	/// Id of the most recently finalized bundle, 0 when none.
	pub async fn last_finalized(&self) -> Result<u64, StorageError> {
		Ok(self
			.retrieve(StorageKey::Checkpoints, LAST_FINALIZED)
			.await?
			.unwrap_or(0))
	}

	pub async fn set_last_finalized(&self, bundle_id: u64) -> Result<(), StorageError> {
		self.store(StorageKey::Checkpoints, LAST_FINALIZED, &bundle_id)
			.await
	}

	/// Last source block fully processed by the source watcher.
	pub async fn source_checkpoint(&self) -> Result<Option<ChainLink>, StorageError> {
		self.retrieve(StorageKey::Checkpoints, SOURCE_CHECKPOINT)
			.await
	}

	pub async fn set_source_checkpoint(&self, link: &ChainLink) -> Result<(), StorageError> {
		self.store(StorageKey::Checkpoints, SOURCE_CHECKPOINT, link)
			.await
	}

	pub async fn store_tip(&self, chain: &str, height: u64) -> Result<(), StorageError> {
		self.store(StorageKey::Tips, chain, &height).await
	}

	pub async fn load_tip(&self, chain: &str) -> Result<Option<u64>, StorageError> {
		self.retrieve(StorageKey::Tips, chain).await
	}

	/// Records which bundle carries each transfer of `bundle`.
	pub async fn index_transfers(&self, bundle: &StatefulBundle) -> Result<(), StorageError> {
		for transfer in bundle.transfers() {
			self.store(StorageKey::Transfers, &transfer.source_tx_hash.to_string(), &bundle.id())
				.await?;
		}
		Ok(())
	}

	/// Id of the bundle carrying the deposit made in `source_tx_hash`.
	pub async fn bundle_for_transfer(&self, source_tx_hash: &B256) -> Result<Option<u64>, StorageError> {
		self.retrieve(StorageKey::Transfers, &source_tx_hash.to_string())
			.await
	}

	pub async fn store_balance(&self, chain: &str, record: &BalanceRecord) -> Result<(), StorageError> {
		self.store(StorageKey::Balances, chain, record).await
	}

	pub async fn load_balance(&self, chain: &str) -> Result<Option<BalanceRecord>, StorageError> {
		self.retrieve(StorageKey::Balances, chain).await
	}

	/// Removes expired entries from storage.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}
