//! Event filters.

use crate::chain::Log;
use crate::hashing::{Bloom, ChainHasher};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Selects logs of one event emitted by one contract.
///
/// The bloom is a cheap pre-filter against block and receipt blooms; the
/// address and topic[0] comparison in [`EventFilter::matches_log`] is the
/// authoritative check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
	contract_address: Address,
	event_hash: B256,
	bloom: Bloom,
}

impl EventFilter {
	/// Builds a filter for `event_signature` on `contract_address`, hashing
	/// the signature with the chain's hasher.
	pub fn new(hasher: ChainHasher, contract_address: Address, event_signature: &str) -> Self {
		Self::from_hash(
			hasher,
			contract_address,
			hasher.event_signature(event_signature),
		)
	}

	/// Builds a filter from an already hashed event signature.
	pub fn from_hash(hasher: ChainHasher, contract_address: Address, event_hash: B256) -> Self {
		let bloom = Bloom::ZERO
			.with(hasher, contract_address.as_slice())
			.with(hasher, event_hash.as_slice());
		Self {
			contract_address,
			event_hash,
			bloom,
		}
	}

	pub fn contract_address(&self) -> &Address {
		&self.contract_address
	}

	pub fn event_hash(&self) -> &B256 {
		&self.event_hash
	}

	pub fn bloom(&self) -> &Bloom {
		&self.bloom
	}

	/// Possible-subset test against a block or receipt bloom.
	pub fn matches(&self, bloom: &Bloom) -> bool {
		bloom.contains(&self.bloom)
	}

	/// Exact match on emitting contract and event signature.
	pub fn matches_log(&self, log: &Log) -> bool {
		log.address == self.contract_address && log.topic(0) == Some(&self.event_hash)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::{address, Bytes};

	#[test]
	fn test_filter_matches_its_own_bloom() {
		let filter = EventFilter::new(
			ChainHasher::Keccak256,
			address!("00000000000000000000000000000000000000aa"),
			"Deposit(bytes32,uint256)",
		);
		let block_bloom = filter
			.bloom()
			.with(ChainHasher::Keccak256, b"unrelated contract");

		assert!(filter.matches(&block_bloom));
		assert!(!filter.matches(&Bloom::ZERO));
	}

	#[test]
	fn test_matches_log_requires_address_and_first_topic() {
		let contract = address!("00000000000000000000000000000000000000aa");
		let filter = EventFilter::new(ChainHasher::Blake2b256, contract, "Processed(bytes32)");
		let log = Log {
			address: contract,
			data: Bytes::new(),
			topics: vec![*filter.event_hash(), B256::repeat_byte(9)],
		};
		assert!(filter.matches_log(&log));

		let mut other_contract = log.clone();
		other_contract.address = Address::ZERO;
		assert!(!filter.matches_log(&other_contract));

		let mut no_topics = log.clone();
		no_topics.topics.clear();
		assert!(!filter.matches_log(&no_topics));

		let mut shifted = log;
		shifted.topics.swap(0, 1);
		assert!(!filter.matches_log(&shifted));
	}
}
