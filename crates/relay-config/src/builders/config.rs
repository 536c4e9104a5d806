//! Configuration builder for tests and local development.

use crate::{
	BundlingConfig, ChainConfig, Config, ConnectionsConfig, DeliveryConfig, MonitorConfig,
	PipelineConfig, RelayConfig, SignatoryConfig, SignerConfig, StorageConfig,
};
use relay_types::{Address, ChainHasher};
use std::collections::HashMap;

/// Builds a valid [`Config`] with small, fast settings.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	relay_id: String,
	source_endpoints: usize,
	source_quorum: usize,
	destination_endpoints: usize,
	destination_quorum: usize,
	destination_hasher: ChainHasher,
	start_block: u64,
	transfers_per_bundle: usize,
	queue_capacity: usize,
	min_depth: u64,
	finalization_depth: u64,
	storage_primary: String,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		Self {
			relay_id: "test-relay".to_string(),
			source_endpoints: 1,
			source_quorum: 1,
			destination_endpoints: 1,
			destination_quorum: 1,
			destination_hasher: ChainHasher::Keccak256,
			start_block: 0,
			transfers_per_bundle: 20,
			queue_capacity: 10,
			min_depth: 1,
			finalization_depth: 2,
			storage_primary: "memory".to_string(),
		}
	}

	pub fn relay_id(mut self, id: impl Into<String>) -> Self {
		self.relay_id = id.into();
		self
	}

	/// Sets the number of source endpoints and the agreement required among them.
	pub fn source_nodes(mut self, endpoints: usize, quorum: usize) -> Self {
		self.source_endpoints = endpoints;
		self.source_quorum = quorum;
		self
	}

	/// Sets the number of destination endpoints and the agreement required among them.
	pub fn destination_nodes(mut self, endpoints: usize, quorum: usize) -> Self {
		self.destination_endpoints = endpoints;
		self.destination_quorum = quorum;
		self
	}

	pub fn destination_hasher(mut self, hasher: ChainHasher) -> Self {
		self.destination_hasher = hasher;
		self
	}

	pub fn start_block(mut self, block: u64) -> Self {
		self.start_block = block;
		self
	}

	pub fn transfers_per_bundle(mut self, count: usize) -> Self {
		self.transfers_per_bundle = count;
		self
	}

	pub fn queue_capacity(mut self, capacity: usize) -> Self {
		self.queue_capacity = capacity;
		self
	}

	/// Sets the destination inclusion and finalization depths.
	pub fn depths(mut self, min_depth: u64, finalization_depth: u64) -> Self {
		self.min_depth = min_depth;
		self.finalization_depth = finalization_depth;
		self
	}

	pub fn storage_primary(mut self, primary: impl Into<String>) -> Self {
		self.storage_primary = primary.into();
		self
	}

	pub fn build(self) -> Config {
		let source = chain(
			"source",
			1,
			ChainHasher::Keccak256,
			Address::repeat_byte(0xaa),
			self.source_endpoints,
			self.source_quorum,
		);
		let destination = chain(
			"destination",
			2,
			self.destination_hasher,
			Address::repeat_byte(0xbb),
			self.destination_endpoints,
			self.destination_quorum,
		);

		let mut signer_settings = toml::Table::new();
		signer_settings.insert("private_key".into(), toml::Value::String(test_key(1)));

		let mut delivery = toml::Table::new();
		delivery.insert("private_key".into(), toml::Value::String(test_key(2)));

		let mut storage_implementations = HashMap::new();
		storage_implementations.insert(
			self.storage_primary.clone(),
			toml::Value::Table(toml::Table::new()),
		);

		Config {
			relay: RelayConfig {
				id: self.relay_id,
				shutdown_timeout_seconds: 1,
				max_concurrent_calls: 16,
			},
			source,
			destination,
			bundling: BundlingConfig {
				deposit_event: "Deposit(bytes32,uint256)".into(),
				start_block: self.start_block,
				tip_distance: 0,
				block_batch_size: 10,
				receipt_batch_size: 10,
				transfers_per_bundle: self.transfers_per_bundle,
				amount_scale_exponent: 10,
				poll_interval_ms: 10,
			},
			pipeline: PipelineConfig {
				queue_capacity: self.queue_capacity,
				slot_reserve: 1,
				min_depth: self.min_depth,
				finalization_depth: self.finalization_depth,
				poll_interval_ms: 10,
				receipt_retry_attempts: 3,
				receipt_retry_sleep_ms: 10,
				finalize_retry_sleep_ms: 10,
				submit_retry_attempts: 3,
				submit_retry_sleep_ms: 10,
				processed_event: "Processed(bytes32,bytes32)".into(),
				distributed_event: "Distributed(bytes32,address,uint128)".into(),
				included_event: "SuccessfulTxHash(bytes32)".into(),
			},
			signer: SignerConfig {
				quorum: 1,
				timeout_ms: 1_000,
				signatories: vec![SignatoryConfig {
					implementation: "local".into(),
					settings: signer_settings,
				}],
			},
			delivery: DeliveryConfig {
				primary: "evm_alloy".into(),
				implementations: HashMap::from([("evm_alloy".to_string(), toml::Value::Table(delivery))]),
			},
			storage: StorageConfig {
				primary: self.storage_primary,
				implementations: storage_implementations,
				cleanup_interval_seconds: 60,
			},
			monitor: MonitorConfig::default(),
			api: None,
		}
	}
}

fn chain(
	name: &str,
	chain_id: u64,
	hasher: ChainHasher,
	bridge_contract: Address,
	endpoints: usize,
	quorum: usize,
) -> ChainConfig {
	let endpoints = (0..endpoints)
		.map(|i| {
			let mut table = toml::Table::new();
			table.insert(
				"rpc_url".into(),
				toml::Value::String(format!("http://127.0.0.1:{}", 8545 + i)),
			);
			toml::Value::Table(table)
		})
		.collect();

	ChainConfig {
		name: name.into(),
		chain_id,
		hasher,
		bridge_contract,
		quorum,
		timeout_ms: 1_000,
		tip_timeout_ms: 500,
		tip_poll_interval_ms: 10,
		shutdown_on_tip_error: true,
		persist_tip: false,
		connections: ConnectionsConfig {
			implementation: "mock".into(),
			endpoints,
		},
	}
}

fn test_key(last_byte: u8) -> String {
	format!("0x{}{:02x}", "00".repeat(31), last_byte)
}
