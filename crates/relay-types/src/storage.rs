//! Storage namespaces used by the relay.

use crate::{Address, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Storage namespaces for the different relay collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Bundles keyed by their zero-padded bundle id.
	Bundles,
	/// Progress markers: next bundle id, last finalized id, source checkpoint.
	Checkpoints,
	/// Latest tip heights observed per chain.
	Tips,
	/// Bundle id of every relayed source transaction.
	Transfers,
	/// Latest relayer account balance per chain.
	Balances,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Bundles => "bundles",
			StorageKey::Checkpoints => "checkpoints",
			StorageKey::Tips => "tips",
			StorageKey::Transfers => "transfers",
			StorageKey::Balances => "balances",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Bundles,
			Self::Checkpoints,
			Self::Tips,
			Self::Transfers,
			Self::Balances,
		]
		.into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"bundles" => Ok(Self::Bundles),
			"checkpoints" => Ok(Self::Checkpoints),
			"tips" => Ok(Self::Tips),
			"transfers" => Ok(Self::Transfers),
			"balances" => Ok(Self::Balances),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}

/// Balance of the account paying for destination transactions, as last
/// observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
	pub account: Address,
	pub balance: U256,
	/// Block the balance was read at.
	pub block_number: u64,
}
