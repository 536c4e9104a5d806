//! File backed storage.
//!
//! One file per key under a base directory. Each file starts with a fixed
//! 64-byte header carrying an optional expiry, followed by the value. Writes
//! go to a temporary file that is then renamed over the target, so a crash
//! never leaves a half written bundle behind.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use relay_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, StorageKey, ValidationError,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

const DEFAULT_STORAGE_PATH: &str = "./data/relay";

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

/// Binary layout (64 bytes):
/// - [0-3]: magic "RLYS"
/// - [4-5]: version (u16 LE)
/// - [6-13]: expiry (u64 LE, Unix seconds, 0 = never)
/// - [14-63]: reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
	version: u16,
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"RLYS";
	const VERSION: u16 = 1;
	const SIZE: usize = 64;

	fn new(ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0
		} else {
			now_secs().saturating_add(ttl.as_secs())
		};
		Self {
			version: Self::VERSION,
			expires_at,
		}
	}

	fn encode(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Unrecognized file format".into()));
		}
		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}
		let mut expires = [0u8; 8];
		expires.copy_from_slice(&bytes[6..14]);
		Ok(Self {
			version,
			expires_at: u64::from_le_bytes(expires),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at != 0 && now_secs() >= self.expires_at
	}
}

/// Per-namespace TTLs, read from `ttl_<namespace>` keys in seconds.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	fn from_config(config: &toml::Value) -> Self {
		let ttls = StorageKey::all()
			.filter_map(|key| {
				config
					.get(format!("ttl_{}", key.as_str()))
					.and_then(|v| v.as_integer())
					.map(|secs| (key, Duration::from_secs(secs as u64)))
			})
			.collect();
		Self { ttls }
	}

	fn ttl_for_key(&self, key: &str) -> Duration {
		key.split(':')
			.next()
			.and_then(|namespace| namespace.parse::<StorageKey>().ok())
			.and_then(|namespace| self.ttls.get(&namespace).copied())
			.unwrap_or(Duration::ZERO)
	}
}

/// Stores every key as a `.bin` file under `base_path`.
pub struct FileStorage {
	base_path: PathBuf,
	ttl_config: TtlConfig,
}

impl FileStorage {
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
		}
	}

	fn file_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace(['/', ':', '\\'], "_");
		self.base_path.join(format!("{}.bin", safe_key))
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let mut data = match fs::read(self.file_path(key)).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StorageError::NotFound),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let header = FileHeader::decode(&data)?;
		if header.is_expired() {
			return Err(StorageError::NotFound);
		}
		Ok(data.split_off(FileHeader::SIZE))
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
		let path = self.file_path(key);
		fs::create_dir_all(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let ttl = ttl.unwrap_or_else(|| self.ttl_config.ttl_for_key(key));
		let mut contents = Vec::with_capacity(FileHeader::SIZE + value.len());
		contents.extend_from_slice(&FileHeader::new(ttl).encode());
		contents.extend_from_slice(&value);

		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, contents)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.file_path(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		match self.get_bytes(key).await {
			Ok(_) => Ok(true),
			Err(StorageError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut removed = 0;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("bin") {
				continue;
			}
			let expired = match fs::read(&path).await {
				Ok(data) => FileHeader::decode(&data).is_ok_and(|h| h.is_expired()),
				Err(e) => {
					tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable file");
					false
				},
			};
			if expired {
				match fs::remove_file(&path).await {
					Ok(()) => removed += 1,
					Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove expired file"),
				}
			}
		}
		Ok(removed)
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let mut optional = vec![Field::new("storage_path", FieldType::String)];
		optional.extend(StorageKey::all().map(|key| {
			Field::new(
				format!("ttl_{}", key.as_str()),
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			)
		}));
		Schema::new(vec![], optional).validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: base directory (default: "./data/relay")
/// - `ttl_<namespace>` for each storage namespace, e.g. `ttl_tips`: TTL in
///   seconds, 0 keeps forever
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or(DEFAULT_STORAGE_PATH);

	Ok(Box::new(FileStorage::new(
		PathBuf::from(storage_path),
		TtlConfig::from_config(config),
	)))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
