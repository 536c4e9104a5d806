//! Destination transaction submission for the bridge relay.
//!
//! A signed bundle becomes a `submitBundle` transaction on the destination
//! bridge contract. The transaction is signed locally with the relayer key
//! and broadcast through the consolidated destination connection, so the
//! relay never trusts a single node with either the nonce or the broadcast.

use async_trait::async_trait;
use relay_chain::{ChainConnection, ChainError};
use relay_types::{Address, ConfigSchema, ImplementationRegistry, StatefulBundle, SubmittedTx, B256};
use std::sync::Arc;
use thiserror::Error;

pub mod contract;

/// Re-export implementations
pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
}

pub use contract::BridgeContract;

/// Errors that can occur during transaction delivery operations.
#[derive(Debug, Error)]
pub enum DeliveryError {
	/// Error that occurs during network communication.
	#[error("Network error: {0}")]
	Network(String),
	/// Error that occurs when a transaction cannot be built or signed.
	#[error("Transaction failed: {0}")]
	TransactionFailed(String),
	/// The node acknowledged the broadcast under a hash other than the one
	/// the signed transaction has.
	#[error("Node reported transaction {reported}, expected {expected}")]
	HashMismatch { expected: B256, reported: B256 },
	#[error("Invalid configuration: {0}")]
	InvalidConfiguration(String),
	#[error(transparent)]
	Chain(#[from] ChainError),
}

/// Submits bundles to the destination bridge contract.
#[async_trait]
pub trait DeliveryInterface: Send + Sync {
	/// Returns the configuration schema for this delivery implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Account paying for and sending the transactions.
	fn sender(&self) -> Address;

	/// Builds, signs and broadcasts the `submitBundle` transaction for a
	/// signed bundle. `tip` is the destination height at submission time.
	async fn submit_bundle(&self, bundle: &StatefulBundle, tip: u64) -> Result<SubmittedTx, DeliveryError>;
}

/// Chain access and addresses a delivery implementation is built with.
#[derive(Clone)]
pub struct DeliveryContext {
	/// Consolidated destination connection.
	pub connection: Arc<dyn ChainConnection>,
	pub chain_id: u64,
	pub bridge_contract: Address,
}

/// Type alias for delivery factory functions.
pub type DeliveryFactory =
	fn(&toml::Value, DeliveryContext) -> Result<Box<dyn DeliveryInterface>, DeliveryError>;

/// Registry trait for delivery implementations.
pub trait DeliveryRegistry: ImplementationRegistry<Factory = DeliveryFactory> {}

/// Get all registered delivery implementations.
pub fn get_all_implementations() -> Vec<(&'static str, DeliveryFactory)> {
	use implementations::evm::alloy;

	vec![(alloy::Registry::NAME, alloy::Registry::factory())]
}

/// Delivery plus the contract lookups the pipeline needs around it.
pub struct DeliveryService {
	implementation: Box<dyn DeliveryInterface>,
	contract: BridgeContract,
}

impl DeliveryService {
	pub fn new(implementation: Box<dyn DeliveryInterface>, contract: BridgeContract) -> Self {
		Self {
			implementation,
			contract,
		}
	}

	pub fn sender(&self) -> Address {
		self.implementation.sender()
	}

	pub async fn submit_bundle(&self, bundle: &StatefulBundle, tip: u64) -> Result<SubmittedTx, DeliveryError> {
		self.implementation.submit_bundle(bundle, tip).await
	}

	/// Transaction hash under which the destination contract recorded
	/// `bundle_hash`, if any.
	pub async fn included_tx_hash(&self, bundle_hash: B256) -> Result<Option<B256>, DeliveryError> {
		self.contract.included_tx_hash(bundle_hash).await
	}

	pub fn contract(&self) -> &BridgeContract {
		&self.contract
	}
}
