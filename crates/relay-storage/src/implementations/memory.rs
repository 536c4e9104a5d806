//! In-memory storage backend.
//!
//! Nothing survives a restart, so this backend suits tests and dry runs.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use relay_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// HashMap backed storage. TTLs are ignored.
#[derive(Default)]
pub struct MemoryStorage {
	store: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.store
			.read()
			.await
			.get(key)
			.cloned()
			.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), StorageError> {
		self.store.write().await.insert(key.to_string(), value);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.store.write().await.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.store.read().await.contains_key(key))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_set_get_delete() {
		let storage = MemoryStorage::new();
		storage.set_bytes("k", b"v1".to_vec(), None).await.unwrap();
		storage.set_bytes("k", b"v2".to_vec(), None).await.unwrap();
		assert_eq!(storage.get_bytes("k").await.unwrap(), b"v2".to_vec());
		assert!(storage.exists("k").await.unwrap());

		storage.delete("k").await.unwrap();
		assert!(!storage.exists("k").await.unwrap());
		assert!(matches!(storage.get_bytes("k").await, Err(StorageError::NotFound)));
		assert_eq!(storage.cleanup_expired().await.unwrap(), 0);
	}
}
