//! Chain primitives as the relay sees them.
//!
//! Blocks, receipts and logs carry a canonical byte encoding with a fixed
//! field order and fixed-width integers. The Blake2b-256 digest of that
//! encoding is the content identity used for equality checks and caching.

use crate::hashing::{blake2b256, Bloom};
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A contract event emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Log {
	/// Contract that emitted the event.
	pub address: Address,
	/// Unindexed event payload.
	pub data: Bytes,
	/// Indexed topics, signature hash first.
	pub topics: Vec<B256>,
}

impl Log {
	/// Canonical encoding: address ‖ data ‖ topics.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(20 + self.data.len() + 32 * self.topics.len());
		out.extend_from_slice(self.address.as_slice());
		out.extend_from_slice(&self.data);
		for topic in &self.topics {
			out.extend_from_slice(topic.as_slice());
		}
		out
	}

	/// Content digest of the canonical encoding.
	pub fn digest(&self) -> B256 {
		blake2b256(&self.encode())
	}

	/// Returns the topic at `index`, if present.
	pub fn topic(&self, index: usize) -> Option<&B256> {
		self.topics.get(index)
	}
}

/// Block header data plus the ordered list of transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
	pub number: u64,
	pub hash: B256,
	pub parent_hash: B256,
	pub logs_bloom: Bloom,
	pub total_difficulty: U256,
	pub timestamp: u64,
	pub transaction_hashes: Vec<B256>,
}

impl Block {
	/// Canonical encoding:
	/// hash ‖ number ‖ parent_hash ‖ total_difficulty ‖ bloom ‖ timestamp ‖ tx hashes.
	///
	/// Integers are big-endian, total difficulty uses its minimal big-endian form.
	pub fn encode(&self) -> Vec<u8> {
		let difficulty = self.total_difficulty.to_be_bytes_trimmed_vec();
		let mut out = Vec::with_capacity(
			32 + 8 + 32 + difficulty.len() + Bloom::BYTES + 8 + 32 * self.transaction_hashes.len(),
		);
		out.extend_from_slice(self.hash.as_slice());
		out.extend_from_slice(&self.number.to_be_bytes());
		out.extend_from_slice(self.parent_hash.as_slice());
		out.extend_from_slice(&difficulty);
		out.extend_from_slice(self.logs_bloom.as_slice());
		out.extend_from_slice(&self.timestamp.to_be_bytes());
		for tx in &self.transaction_hashes {
			out.extend_from_slice(tx.as_slice());
		}
		out
	}

	/// Content digest of the canonical encoding.
	pub fn digest(&self) -> B256 {
		blake2b256(&self.encode())
	}

	/// The (number, hash) pair identifying this block in a chain history.
	pub fn link(&self) -> ChainLink {
		ChainLink {
			number: self.number,
			hash: self.hash,
		}
	}
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
	pub block_number: u64,
	pub transaction_hash: B256,
	pub block_hash: B256,
	pub from: Address,
	/// Recipient; `None` for contract creation. Encoded as the zero address.
	pub to: Option<Address>,
	pub logs_bloom: Bloom,
	pub logs: Vec<Log>,
	pub status: bool,
	pub transaction_index: u32,
}

impl Receipt {
	/// Canonical encoding:
	/// block_number ‖ tx_hash ‖ block_hash ‖ from ‖ to ‖ bloom ‖ log digests ‖ status ‖ tx_index.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(8 + 32 + 32 + 20 + 20 + Bloom::BYTES + 32 * self.logs.len() + 1 + 4);
		out.extend_from_slice(&self.block_number.to_be_bytes());
		out.extend_from_slice(self.transaction_hash.as_slice());
		out.extend_from_slice(self.block_hash.as_slice());
		out.extend_from_slice(self.from.as_slice());
		out.extend_from_slice(self.to.unwrap_or(Address::ZERO).as_slice());
		out.extend_from_slice(self.logs_bloom.as_slice());
		for log in &self.logs {
			out.extend_from_slice(log.digest().as_slice());
		}
		out.push(self.status as u8);
		out.extend_from_slice(&self.transaction_index.to_be_bytes());
		out
	}

	/// Content digest of the canonical encoding.
	pub fn digest(&self) -> B256 {
		blake2b256(&self.encode())
	}
}

/// A block together with the receipts of all of its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWithReceipts {
	pub block: Block,
	pub receipts: Vec<Receipt>,
}

/// Identity of a block within a chain history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainLink {
	pub number: u64,
	pub hash: B256,
}

/// Block selector for state reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockTag {
	#[default]
	Latest,
	Number(u64),
}

impl fmt::Display for BlockTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BlockTag::Latest => write!(f, "latest"),
			BlockTag::Number(n) => write!(f, "{:#x}", n),
		}
	}
}
