//! Common types for the bridge relay.
//!
//! This crate defines the chain data model shared by every relay component:
//! blocks, receipts, logs and their canonical encodings, bloom filters,
//! transfer bundles and their lifecycle, plus configuration validation helpers.

/// Transfer bundles and their processing lifecycle.
pub mod bundle;
/// Blocks, receipts and logs as seen by the relay.
pub mod chain;
/// Event filters matched against blooms and logs.
pub mod filter;
/// Chain specific hash functions and the 2048-bit log bloom.
pub mod hashing;
/// Registry trait for pluggable implementations.
pub mod registry;
/// Secret wrapper for private keys.
pub mod secret_string;
/// Storage namespaces.
pub mod storage;
/// Utility functions for formatting and conversion.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use bundle::*;
pub use chain::*;
pub use filter::EventFilter;
pub use hashing::{blake2b256, Bloom, ChainHasher};
pub use registry::ImplementationRegistry;
pub use secret_string::SecretString;
pub use storage::{BalanceRecord, StorageKey};
pub use utils::{short_hash, truncate_id, with_0x_prefix, without_0x_prefix};
pub use validation::*;

/// 32-byte hash used for block, transaction and bundle identities.
pub type Hash32 = B256;
