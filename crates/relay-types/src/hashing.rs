//! Hash functions and log blooms.
//!
//! Each chain hashes event signatures and sets bloom bits with its own hash
//! family. The hasher is a plain value passed to whoever needs it, so no
//! digest state is shared between components.

use alloy_primitives::{FixedBytes, B256};
use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Serialize};
use sha3::Keccak256;

type Blake2bHasher = Blake2b<U32>;

/// Computes the Blake2b-256 digest of `data`.
///
/// Canonical content digests of blocks, receipts, logs and bundles are always
/// Blake2b-256, independent of the chain they come from.
pub fn blake2b256(data: &[u8]) -> B256 {
	B256::from_slice(&Blake2bHasher::digest(data))
}

/// Hash family used by a chain for event topics and bloom bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainHasher {
	/// Ethereum style Keccak-256.
	#[default]
	Keccak256,
	/// Blake2b-256, as used by Aion style chains.
	Blake2b256,
}

impl ChainHasher {
	/// Hashes arbitrary bytes.
	pub fn hash(&self, data: &[u8]) -> B256 {
		match self {
			ChainHasher::Keccak256 => B256::from_slice(&Keccak256::digest(data)),
			ChainHasher::Blake2b256 => blake2b256(data),
		}
	}

	/// Derives the topic hash of an event signature such as
	/// `Transfer(address,address,uint256)`.
	pub fn event_signature(&self, signature: &str) -> B256 {
		self.hash(signature.as_bytes())
	}
}

/// 2048-bit log bloom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bloom(FixedBytes<256>);

impl Bloom {
	/// Size of a bloom in bytes.
	pub const BYTES: usize = 256;

	/// An empty bloom.
	pub const ZERO: Bloom = Bloom(FixedBytes::ZERO);

	/// Wraps raw bloom bytes.
	pub const fn new(bytes: [u8; 256]) -> Self {
		Self(FixedBytes(bytes))
	}

	/// Builds a bloom from a slice, returning `None` when it is not 256 bytes long.
	pub fn from_slice(bytes: &[u8]) -> Option<Self> {
		if bytes.len() != Self::BYTES {
			return None;
		}
		Some(Self(FixedBytes::from_slice(bytes)))
	}

	/// Raw bloom bytes.
	pub fn as_slice(&self) -> &[u8] {
		self.0.as_slice()
	}

	/// Sets the three bits selected by the hash of `data`.
	pub fn accrue(&mut self, hasher: ChainHasher, data: &[u8]) {
		let hash = hasher.hash(data);
		for i in 0..3 {
			let bit = (((hash[2 * i] as usize) << 8) | hash[2 * i + 1] as usize) & 2047;
			self.0[Self::BYTES - 1 - bit / 8] |= 1 << (bit % 8);
		}
	}

	/// Returns a copy of this bloom with the bits of `data` set.
	pub fn with(mut self, hasher: ChainHasher, data: &[u8]) -> Self {
		self.accrue(hasher, data);
		self
	}

	/// True when every bit set in `other` is also set here.
	///
	/// False positives are possible, false negatives are not.
	pub fn contains(&self, other: &Bloom) -> bool {
		self.0
			.iter()
			.zip(other.0.iter())
			.all(|(mine, theirs)| mine & theirs == *theirs)
	}
}

impl From<[u8; 256]> for Bloom {
	fn from(bytes: [u8; 256]) -> Self {
		Self::new(bytes)
	}
}

impl From<alloy_primitives::Bloom> for Bloom {
	fn from(bloom: alloy_primitives::Bloom) -> Self {
		Self(bloom.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::{address, b256};

	#[test]
	fn test_keccak_event_signature() {
		let hash = ChainHasher::Keccak256.event_signature("Transfer(address,address,uint256)");
		assert_eq!(
			hash,
			b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
		);
	}

	#[test]
	fn test_hashers_differ() {
		let data = b"Deposit(bytes32,uint256)";
		assert_ne!(
			ChainHasher::Keccak256.hash(data),
			ChainHasher::Blake2b256.hash(data)
		);
		assert_eq!(ChainHasher::Blake2b256.hash(data), blake2b256(data));
	}

	#[test]
	fn test_bloom_accrue_sets_at_most_three_bits() {
		let bloom = Bloom::ZERO.with(ChainHasher::Keccak256, b"relay");
		let bits: u32 = bloom.as_slice().iter().map(|b| b.count_ones()).sum();
		assert!((1..=3).contains(&bits));
	}

	#[test]
	fn test_bloom_matches_keccak_reference() {
		// Our bit layout must agree with the Ethereum bloom for Keccak chains.
		let contract = address!("b8901acb165ed027e32754e0ffe830802919727f");
		let mut reference = alloy_primitives::Bloom::ZERO;
		reference.accrue(alloy_primitives::BloomInput::Raw(contract.as_slice()));

		let ours = Bloom::ZERO.with(ChainHasher::Keccak256, contract.as_slice());
		assert_eq!(ours, Bloom::from(reference));
	}

	#[test]
	fn test_bloom_contains() {
		let a = Bloom::ZERO.with(ChainHasher::Blake2b256, b"a");
		let ab = a.with(ChainHasher::Blake2b256, b"b");

		assert!(ab.contains(&a));
		assert!(ab.contains(&Bloom::ZERO));
		assert!(!Bloom::ZERO.contains(&a));
	}

	#[test]
	fn test_from_slice_rejects_bad_length() {
		assert!(Bloom::from_slice(&[0u8; 255]).is_none());
		assert_eq!(Bloom::from_slice(&[0u8; 256]), Some(Bloom::ZERO));
	}
}
