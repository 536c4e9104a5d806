//! Configuration module for the bridge relay.
//!
//! Configuration is read from TOML. Values may reference environment
//! variables as `${VAR}` or `${VAR:-default}`, and a file may pull in others
//! with `include = ["file1.toml", "file2.toml"]`. Each top-level section must
//! be unique across all included files.

mod loader;

#[cfg(any(test, feature = "testing"))]
pub mod builders;

use regex::Regex;
use relay_types::{Address, ChainHasher, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		ConfigError::Parse(err.message().to_string())
	}
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity and process-level settings.
	pub relay: RelayConfig,
	/// Chain deposits are read from.
	pub source: ChainConfig,
	/// Chain bundles are submitted to.
	pub destination: ChainConfig,
	/// How source deposits become bundles.
	pub bundling: BundlingConfig,
	/// Queue sizes, depths and retry policy of the worker pipeline.
	pub pipeline: PipelineConfig,
	/// Co-signing signatories.
	pub signer: SignerConfig,
	/// Destination transaction submission.
	pub delivery: DeliveryConfig,
	/// Bundle persistence.
	pub storage: StorageConfig,
	/// Relayer balance monitoring.
	#[serde(default)]
	pub monitor: MonitorConfig,
	/// Read-only HTTP status API.
	pub api: Option<ApiConfig>,
}

/// Identity and process-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
	/// Unique identifier for this relay instance.
	pub id: String,
	/// Seconds to wait for workers to unwind after shutdown is requested.
	#[serde(default = "default_shutdown_timeout_seconds")]
	pub shutdown_timeout_seconds: u64,
	/// Upper bound on concurrent RPC calls across all quorum fan-outs.
	#[serde(default = "default_max_concurrent_calls")]
	pub max_concurrent_calls: usize,
}

fn default_shutdown_timeout_seconds() -> u64 {
	30
}

fn default_max_concurrent_calls() -> usize {
	64
}

/// Connection and quorum settings for one chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
	/// Human readable chain name, used in logs.
	pub name: String,
	pub chain_id: u64,
	/// Hash family for event topics and blooms.
	#[serde(default)]
	pub hasher: ChainHasher,
	/// Bridge contract on this chain.
	pub bridge_contract: Address,
	/// Number of agreeing nodes required for any answer.
	pub quorum: usize,
	/// Timeout for consolidated calls in milliseconds.
	#[serde(default = "default_call_timeout_ms")]
	pub timeout_ms: u64,
	/// Timeout for tip height collection in milliseconds. Zero disables it.
	#[serde(default = "default_tip_timeout_ms")]
	pub tip_timeout_ms: u64,
	/// Interval between tip height polls in milliseconds.
	#[serde(default = "default_tip_poll_interval_ms")]
	pub tip_poll_interval_ms: u64,
	/// Halt the relay after repeated tip failures instead of only warning.
	#[serde(default = "default_true")]
	pub shutdown_on_tip_error: bool,
	/// Persist the latest tip height to storage.
	#[serde(default)]
	pub persist_tip: bool,
	/// Node endpoints.
	pub connections: ConnectionsConfig,
}

/// Node endpoints of a chain, all served by one implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionsConfig {
	/// Name of the connection implementation, e.g. "evm_alloy".
	pub implementation: String,
	/// One table per node, passed to the implementation factory.
	pub endpoints: Vec<toml::Value>,
}

fn default_call_timeout_ms() -> u64 {
	10_000
}

fn default_tip_timeout_ms() -> u64 {
	5_000
}

fn default_tip_poll_interval_ms() -> u64 {
	10_000
}

fn default_true() -> bool {
	true
}

/// How source deposits become bundles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundlingConfig {
	/// Deposit event signature on the source bridge contract.
	pub deposit_event: String,
	/// First source block to scan when no checkpoint exists.
	pub start_block: u64,
	/// Blocks to stay behind the source tip.
	#[serde(default)]
	pub tip_distance: u64,
	/// Maximum blocks fetched per round.
	#[serde(default = "default_block_batch_size")]
	pub block_batch_size: u64,
	/// Maximum receipts requested per batch.
	#[serde(default = "default_receipt_batch_size")]
	pub receipt_batch_size: usize,
	/// Maximum transfers per bundle.
	#[serde(default = "default_transfers_per_bundle")]
	pub transfers_per_bundle: usize,
	/// Deposit amounts are multiplied by 10^exponent.
	#[serde(default = "default_amount_scale_exponent")]
	pub amount_scale_exponent: u32,
	/// Delay between rounds once caught up, in milliseconds.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
}

fn default_block_batch_size() -> u64 {
	100
}

fn default_receipt_batch_size() -> usize {
	200
}

fn default_transfers_per_bundle() -> usize {
	20
}

fn default_amount_scale_exponent() -> u32 {
	10
}

fn default_poll_interval_ms() -> u64 {
	5_000
}

/// Queue sizes, depths and retry policy of the worker pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
	/// Capacity of every inter-stage queue.
	#[serde(default = "default_queue_capacity")]
	pub queue_capacity: usize,
	/// Free slots the downstream queue must have before a stage takes work.
	#[serde(default = "default_slot_reserve")]
	pub slot_reserve: usize,
	/// Destination confirmations before a receipt is trusted.
	pub min_depth: u64,
	/// Destination confirmations before a bundle is final.
	pub finalization_depth: u64,
	/// Upper bound on waits for tip progress, in milliseconds.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	/// Attempts when fetching a submitted receipt.
	#[serde(default = "default_retry_attempts")]
	pub receipt_retry_attempts: usize,
	/// Sleep between receipt attempts, in milliseconds.
	#[serde(default = "default_receipt_retry_sleep_ms")]
	pub receipt_retry_sleep_ms: u64,
	/// Sleep between receipt attempts during finalization, in milliseconds.
	#[serde(default = "default_finalize_retry_sleep_ms")]
	pub finalize_retry_sleep_ms: u64,
	/// Attempts when collecting signatures or broadcasting.
	#[serde(default = "default_retry_attempts")]
	pub submit_retry_attempts: usize,
	/// Sleep between signing and broadcast attempts, in milliseconds.
	#[serde(default = "default_submit_retry_sleep_ms")]
	pub submit_retry_sleep_ms: u64,
	/// Destination bundle-processed event signature.
	pub processed_event: String,
	/// Destination per-transfer distribution event signature.
	pub distributed_event: String,
	/// Destination event marking a bundle already included by another transaction.
	pub included_event: String,
}

fn default_queue_capacity() -> usize {
	100
}

fn default_slot_reserve() -> usize {
	1
}

fn default_retry_attempts() -> usize {
	3
}

fn default_receipt_retry_sleep_ms() -> u64 {
	50_000
}

fn default_finalize_retry_sleep_ms() -> u64 {
	30_000
}

fn default_submit_retry_sleep_ms() -> u64 {
	10_000
}

/// Co-signing signatories.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignerConfig {
	/// Signatures required per bundle.
	pub quorum: usize,
	/// Timeout for one signature round, in milliseconds.
	#[serde(default = "default_call_timeout_ms")]
	pub timeout_ms: u64,
	/// One entry per signatory, each naming its implementation.
	pub signatories: Vec<SignatoryConfig>,
}

/// A single signatory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatoryConfig {
	/// Name of the signer implementation, e.g. "local".
	pub implementation: String,
	/// Implementation specific settings.
	#[serde(flatten)]
	pub settings: toml::Table,
}

/// Destination transaction submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
	/// Which implementation to use.
	pub primary: String,
	/// Map of delivery implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	3_600
}

/// Balance monitoring of the account paying for destination transactions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
	/// Alert once when the balance drops below this, in the destination's
	/// smallest unit. Written as a decimal or 0x-prefixed string.
	#[serde(default)]
	pub min_balance: Option<U256>,
	/// Seconds between balance reads.
	#[serde(default = "default_balance_poll_interval_seconds")]
	pub balance_poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			min_balance: None,
			balance_poll_interval_seconds: default_balance_poll_interval_seconds(),
		}
	}
}

fn default_balance_poll_interval_seconds() -> u64 {
	60
}

/// Configuration for the HTTP status API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Reported to clients so they can show that relaying is paused.
	#[serde(default)]
	pub maintenance: bool,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut missing = None;
	let resolved = re.replace_all(input, |caps: &regex::Captures<'_>| {
		let var_name = &caps[1];
		match (std::env::var(var_name), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| var_name.to_string());
				String::new()
			},
		}
	});

	match missing {
		Some(var_name) => Err(ConfigError::Validation(format!(
			"Environment variable '{}' not found",
			var_name
		))),
		None => Ok(resolved.into_owned()),
	}
}

impl Config {
	/// Loads configuration from a file, following include directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Checks cross-field constraints that serde cannot express.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.relay.id.is_empty() {
			return Err(ConfigError::Validation("Relay ID cannot be empty".into()));
		}
		if self.relay.max_concurrent_calls == 0 {
			return Err(ConfigError::Validation(
				"relay.max_concurrent_calls must be at least 1".into(),
			));
		}

		validate_chain("source", &self.source)?;
		validate_chain("destination", &self.destination)?;

		if self.bundling.deposit_event.is_empty() {
			return Err(ConfigError::Validation(
				"bundling.deposit_event cannot be empty".into(),
			));
		}
		if self.bundling.block_batch_size == 0 || self.bundling.receipt_batch_size == 0 {
			return Err(ConfigError::Validation(
				"bundling batch sizes must be at least 1".into(),
			));
		}
		if self.bundling.transfers_per_bundle == 0 {
			return Err(ConfigError::Validation(
				"bundling.transfers_per_bundle must be at least 1".into(),
			));
		}
		if self.bundling.amount_scale_exponent > 38 {
			return Err(ConfigError::Validation(
				"bundling.amount_scale_exponent cannot exceed 38".into(),
			));
		}

		let pipeline = &self.pipeline;
		if pipeline.queue_capacity == 0 {
			return Err(ConfigError::Validation(
				"pipeline.queue_capacity must be at least 1".into(),
			));
		}
		if pipeline.slot_reserve == 0 || pipeline.slot_reserve > pipeline.queue_capacity {
			return Err(ConfigError::Validation(format!(
				"pipeline.slot_reserve must be between 1 and queue_capacity ({})",
				pipeline.queue_capacity
			)));
		}
		if pipeline.finalization_depth < pipeline.min_depth {
			return Err(ConfigError::Validation(
				"pipeline.finalization_depth cannot be lower than min_depth".into(),
			));
		}
		if pipeline.receipt_retry_attempts == 0 || pipeline.submit_retry_attempts == 0 {
			return Err(ConfigError::Validation(
				"pipeline retry attempts must be at least 1".into(),
			));
		}
		for (name, event) in [
			("processed_event", &pipeline.processed_event),
			("distributed_event", &pipeline.distributed_event),
			("included_event", &pipeline.included_event),
		] {
			if event.is_empty() {
				return Err(ConfigError::Validation(format!(
					"pipeline.{} cannot be empty",
					name
				)));
			}
		}

		if self.signer.signatories.is_empty() {
			return Err(ConfigError::Validation(
				"At least one signatory required".into(),
			));
		}
		if self.signer.quorum == 0 || self.signer.quorum > self.signer.signatories.len() {
			return Err(ConfigError::Validation(format!(
				"signer.quorum must be between 1 and the number of signatories ({})",
				self.signer.signatories.len()
			)));
		}

		if !self
			.delivery
			.implementations
			.contains_key(&self.delivery.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary delivery '{}' has no configuration",
				self.delivery.primary
			)));
		}

		if !self.storage.implementations.contains_key(&self.storage.primary) {
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' has no configuration",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.monitor.balance_poll_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"monitor.balance_poll_interval_seconds must be greater than 0".into(),
			));
		}

		Ok(())
	}
}

fn validate_chain(section: &str, chain: &ChainConfig) -> Result<(), ConfigError> {
	let endpoints = chain.connections.endpoints.len();
	if endpoints == 0 {
		return Err(ConfigError::Validation(format!(
			"{}.connections.endpoints cannot be empty",
			section
		)));
	}
	if chain.quorum == 0 || chain.quorum > endpoints {
		return Err(ConfigError::Validation(format!(
			"{}.quorum must be between 1 and the number of endpoints ({})",
			section, endpoints
		)));
	}
	if chain.tip_poll_interval_ms == 0 {
		return Err(ConfigError::Validation(format!(
			"{}.tip_poll_interval_ms must be greater than 0",
			section
		)));
	}
	Ok(())
}

/// Parses a TOML string, resolving environment variables and validating the
/// result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
