//! Registry trait for self-registering implementations.

/// Base trait for implementation registries.
///
/// Every pluggable backend (chain connection, signer, delivery, storage)
/// exposes a `Registry` struct naming the TOML key it is configured under and
/// the factory that builds it, for example:
/// - "evm_alloy" under `[source.connections.evm_alloy]`
/// - "memory" under `[storage.implementations.memory]`
/// - "local" under `[signer.implementations.local]`
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Returns the factory that builds this implementation from its configuration.
	fn factory() -> Self::Factory;
}
