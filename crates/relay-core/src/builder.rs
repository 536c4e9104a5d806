//! Builder pattern for constructing relay engines.
//!
//! Every pluggable service is created through a factory looked up by the
//! implementation name in the configuration. Chain connections may also be
//! handed in directly, which tests use to run the relay against scripted
//! nodes.

use crate::engine::RelayEngine;
use crate::policy::BundlingPolicy;
use relay_chain::{BlockNumberCollector, ChainConnection, ConnectionFactory, ConsolidatedChainConnection};
use relay_config::{ChainConfig, Config};
use relay_delivery::{BridgeContract, DeliveryContext, DeliveryFactory, DeliveryService};
use relay_signer::{BundleValidator, SignatoryCollector, SignerFactory, SignerInterface};
use relay_storage::{StorageFactory, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors that can occur during relay engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for every pluggable service, keyed by implementation
/// name.
#[derive(Default)]
pub struct RelayFactories {
	pub connection_factories: HashMap<String, ConnectionFactory>,
	pub signer_factories: HashMap<String, SignerFactory>,
	pub delivery_factories: HashMap<String, DeliveryFactory>,
	pub storage_factories: HashMap<String, StorageFactory>,
}

/// Builder for constructing a [`RelayEngine`] with pluggable implementations.
pub struct RelayBuilder {
	config: Config,
	source_connections: Option<Vec<Arc<dyn ChainConnection>>>,
	destination_connections: Option<Vec<Arc<dyn ChainConnection>>>,
}

impl RelayBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			source_connections: None,
			destination_connections: None,
		}
	}

	/// Uses these source nodes instead of creating them from configuration.
	pub fn with_source_connections(mut self, connections: Vec<Arc<dyn ChainConnection>>) -> Self {
		self.source_connections = Some(connections);
		self
	}

	/// Uses these destination nodes instead of creating them from configuration.
	pub fn with_destination_connections(mut self, connections: Vec<Arc<dyn ChainConnection>>) -> Self {
		self.destination_connections = Some(connections);
		self
	}

	/// Builds the RelayEngine using factories for each component type.
	pub async fn build(self, factories: RelayFactories) -> Result<RelayEngine, BuilderError> {
		let config = self.config;

		// Storage
		let mut storage_impls = HashMap::new();
		for (name, settings) in &config.storage.implementations {
			if let Some(factory) = factories.storage_factories.get(name) {
				match factory(settings) {
					Ok(implementation) => {
						storage_impls.insert(name.clone(), implementation);
						let is_primary = &config.storage.primary == name;
						tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Failed to create storage implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create storage implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}
		let primary_storage = &config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::MissingComponent(format!(
				"Primary storage '{}' failed to load or has no factory",
				primary_storage
			))
		})?;
		let storage = Arc::new(StorageService::new(storage_backend));

		// Chains
		let limiter = Arc::new(Semaphore::new(config.relay.max_concurrent_calls.max(1)));
		let source_nodes = match self.source_connections {
			Some(nodes) => nodes,
			None => create_connections(&config.source, &factories.connection_factories)?,
		};
		let destination_nodes = match self.destination_connections {
			Some(nodes) => nodes,
			None => create_connections(&config.destination, &factories.connection_factories)?,
		};

		let source = consolidate(&config.source, source_nodes.clone(), &limiter)?;
		let destination = consolidate(&config.destination, destination_nodes.clone(), &limiter)?;
		let source_tip = tip_collector(&config.source, source_nodes, &limiter, &storage).await?;
		let destination_tip = tip_collector(&config.destination, destination_nodes, &limiter, &storage).await?;

		// Signatories
		let mut signers: Vec<Arc<dyn SignerInterface>> = Vec::with_capacity(config.signer.signatories.len());
		for (index, signatory) in config.signer.signatories.iter().enumerate() {
			let factory = factories
				.signer_factories
				.get(&signatory.implementation)
				.ok_or_else(|| {
					BuilderError::MissingComponent(format!(
						"No signer implementation named '{}'",
						signatory.implementation
					))
				})?;
			let signer = factory(&toml::Value::Table(signatory.settings.clone())).map_err(|e| {
				BuilderError::Config(format!("Failed to create signatory {}: {}", index, e))
			})?;
			tracing::info!(
				component = "signer",
				implementation = %signatory.implementation,
				address = %signer.address(),
				"Loaded"
			);
			signers.push(Arc::from(signer));
		}
		let signatories = SignatoryCollector::new(
			signers,
			config.signer.quorum,
			Duration::from_millis(config.signer.timeout_ms),
		)
		.map_err(|e| BuilderError::Config(format!("Invalid signatory set: {}", e)))?;
		let bundling = BundlingPolicy::from_config(&config.source, &config.bundling)
			.map_err(|e| BuilderError::Config(format!("Invalid bundling settings: {}", e)))?;
		let signatories = signatories.with_validator(Arc::new(BundleValidator::new(source.clone(), Arc::new(bundling))));

		// Delivery
		let context = DeliveryContext {
			connection: destination.clone(),
			chain_id: config.destination.chain_id,
			bridge_contract: config.destination.bridge_contract,
		};
		let mut delivery_impls = HashMap::new();
		for (name, settings) in &config.delivery.implementations {
			if let Some(factory) = factories.delivery_factories.get(name) {
				match factory(settings, context.clone()) {
					Ok(implementation) => {
						let is_primary = &config.delivery.primary == name;
						tracing::info!(
							component = "delivery",
							implementation = %name,
							sender = %implementation.sender(),
							enabled = %is_primary,
							"Loaded"
						);
						delivery_impls.insert(name.clone(), implementation);
					},
					Err(e) => {
						tracing::error!(
							component = "delivery",
							implementation = %name,
							error = %e,
							"Failed to create delivery implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create delivery implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}
		let delivery_impl = delivery_impls.remove(&config.delivery.primary).ok_or_else(|| {
			BuilderError::MissingComponent(format!(
				"Primary delivery '{}' failed to load or has no factory",
				config.delivery.primary
			))
		})?;
		let delivery = DeliveryService::new(
			delivery_impl,
			BridgeContract::new(destination.clone(), config.destination.bridge_contract),
		);

		Ok(RelayEngine::new(
			config,
			storage,
			source,
			destination,
			source_tip,
			destination_tip,
			Arc::new(signatories),
			Arc::new(delivery),
		))
	}
}

fn create_connections(
	chain: &ChainConfig,
	factories: &HashMap<String, ConnectionFactory>,
) -> Result<Vec<Arc<dyn ChainConnection>>, BuilderError> {
	let implementation = &chain.connections.implementation;
	let factory = factories.get(implementation).ok_or_else(|| {
		BuilderError::MissingComponent(format!(
			"No connection implementation named '{}' for {}",
			implementation, chain.name
		))
	})?;

	let mut connections: Vec<Arc<dyn ChainConnection>> = Vec::with_capacity(chain.connections.endpoints.len());
	for (index, endpoint) in chain.connections.endpoints.iter().enumerate() {
		let connection = factory(endpoint).map_err(|e| {
			BuilderError::Config(format!("Failed to create {} connection {}: {}", chain.name, index, e))
		})?;
		tracing::info!(
			component = "connection",
			chain = %chain.name,
			implementation = %implementation,
			endpoint = %connection.name(),
			"Loaded"
		);
		connections.push(Arc::from(connection));
	}
	Ok(connections)
}

fn consolidate(
	chain: &ChainConfig,
	nodes: Vec<Arc<dyn ChainConnection>>,
	limiter: &Arc<Semaphore>,
) -> Result<Arc<dyn ChainConnection>, BuilderError> {
	let consolidated = ConsolidatedChainConnection::new(
		chain.name.clone(),
		nodes,
		chain.quorum,
		Duration::from_millis(chain.timeout_ms),
	)
	.map_err(|e| BuilderError::Config(format!("Invalid {} connection set: {}", chain.name, e)))?
	.with_limiter(limiter.clone());
	Ok(Arc::new(consolidated))
}

/// Tip collector for `chain`, seeded with the persisted tip when enabled.
async fn tip_collector(
	chain: &ChainConfig,
	nodes: Vec<Arc<dyn ChainConnection>>,
	limiter: &Arc<Semaphore>,
	storage: &StorageService,
) -> Result<Arc<BlockNumberCollector>, BuilderError> {
	let mut collector = BlockNumberCollector::new(nodes, chain.quorum, Duration::from_millis(chain.tip_timeout_ms))
		.map_err(|e| BuilderError::Config(format!("Invalid {} tip collector: {}", chain.name, e)))?
		.with_limiter(limiter.clone());

	if chain.persist_tip {
		let stored = storage
			.load_tip(&chain.name)
			.await
			.map_err(|e| BuilderError::Config(format!("Failed to load {} tip: {}", chain.name, e)))?;
		if let Some(height) = stored {
			tracing::info!(chain = %chain.name, height, "Resuming from persisted tip");
			collector = collector.with_floor(height);
		}
	}
	Ok(Arc::new(collector))
}
