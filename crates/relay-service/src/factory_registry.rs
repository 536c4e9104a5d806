//! Factory registry for relay implementations.
//!
//! Collects the implementations each crate registers and hands them to the
//! [`RelayBuilder`] keyed by the names used in configuration.

use relay_config::Config;
use relay_core::{BuilderError, RelayBuilder, RelayEngine, RelayFactories};
use std::collections::HashMap;

/// Turns a crate's `(name, factory)` list into a lookup map.
fn factory_map<F>(implementations: Vec<(&'static str, F)>) -> HashMap<String, F> {
	implementations
		.into_iter()
		.map(|(name, factory)| (name.to_string(), factory))
		.collect()
}

/// Every implementation compiled into this binary.
pub fn registered_factories() -> RelayFactories {
	RelayFactories {
		connection_factories: factory_map(relay_chain::get_all_implementations()),
		signer_factories: factory_map(relay_signer::get_all_implementations()),
		delivery_factories: factory_map(relay_delivery::get_all_implementations()),
		storage_factories: factory_map(relay_storage::get_all_implementations()),
	}
}

/// Builds the relay engine from configuration with all registered
/// implementations.
pub async fn build_relay(config: Config) -> Result<RelayEngine, BuilderError> {
	RelayBuilder::new(config).build(registered_factories()).await
}
