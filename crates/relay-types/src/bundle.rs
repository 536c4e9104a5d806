//! Transfer bundles and their lifecycle.
//!
//! Source-chain deposits become [`Transfer`]s, which are grouped into
//! [`Bundle`]s per source block. A [`StatefulBundle`] carries a bundle through
//! the pipeline:
//!
//! Bundled -> Stored -> Signed -> Submitted -> Sealed -> Finalized
//!
//! Every transition checks the prior state. Sealed means the destination
//! receipt has been confirmed at the minimum depth.

use crate::chain::Receipt;
use crate::hashing::blake2b256;
use crate::utils::short_hash;
use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors raised when a bundle is moved through an invalid transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleStateError {
	#[error("Invalid bundle state transition from {from} to {to}")]
	InvalidTransition { from: BundleState, to: BundleState },
	#[error("Invalid bundle operation in state {state}: {operation}")]
	InvalidOperation {
		state: BundleState,
		operation: &'static str,
	},
}

/// A single deposit to be paid out on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transfer {
	/// Hash of the source transaction that made the deposit.
	pub source_tx_hash: B256,
	/// Destination recipient.
	pub recipient: Address,
	/// Amount in destination units.
	pub amount: u128,
}

impl Transfer {
	/// Encoded length: tx hash, recipient word, 16-byte amount.
	pub const ENCODED_LEN: usize = 32 + 32 + 16;

	pub fn new(source_tx_hash: B256, recipient: Address, amount: u128) -> Self {
		Self {
			source_tx_hash,
			recipient,
			amount,
		}
	}

	/// Canonical encoding: source_tx_hash ‖ recipient (left padded to 32) ‖ amount (16, BE).
	pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
		let mut out = [0u8; Self::ENCODED_LEN];
		out[..32].copy_from_slice(self.source_tx_hash.as_slice());
		out[32..64].copy_from_slice(self.recipient.into_word().as_slice());
		out[64..].copy_from_slice(&self.amount.to_be_bytes());
		out
	}

	/// Digest of the canonical encoding.
	pub fn digest(&self) -> B256 {
		blake2b256(&self.encode())
	}
}

/// Ordered group of transfers originating from one source block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bundle {
	source_block_number: u64,
	source_block_hash: B256,
	index_in_block: u32,
	transfers: Vec<Transfer>,
	bundle_hash: B256,
}

impl Bundle {
	pub fn new(
		source_block_number: u64,
		source_block_hash: B256,
		index_in_block: u32,
		transfers: Vec<Transfer>,
	) -> Self {
		let bundle_hash = Self::compute_hash(&source_block_hash, &transfers);
		Self {
			source_block_number,
			source_block_hash,
			index_in_block,
			transfers,
			bundle_hash,
		}
	}

	/// Blake2b-256 over source_block_hash ‖ each transfer's encoding.
	pub fn compute_hash(source_block_hash: &B256, transfers: &[Transfer]) -> B256 {
		let mut data = Vec::with_capacity(32 + transfers.len() * Transfer::ENCODED_LEN);
		data.extend_from_slice(source_block_hash.as_slice());
		for transfer in transfers {
			data.extend_from_slice(&transfer.encode());
		}
		blake2b256(&data)
	}

	pub fn source_block_number(&self) -> u64 {
		self.source_block_number
	}

	pub fn source_block_hash(&self) -> &B256 {
		&self.source_block_hash
	}

	pub fn index_in_block(&self) -> u32 {
		self.index_in_block
	}

	pub fn transfers(&self) -> &[Transfer] {
		&self.transfers
	}

	pub fn bundle_hash(&self) -> &B256 {
		&self.bundle_hash
	}

	/// True when both sides hold the same transfers with the same
	/// multiplicities, regardless of order.
	pub fn same_transfers(&self, other: &[Transfer]) -> bool {
		if self.transfers.len() != other.len() {
			return false;
		}
		let sorted = |transfers: &[Transfer]| {
			let mut encoded: Vec<_> = transfers.iter().map(Transfer::encode).collect();
			encoded.sort_unstable();
			encoded
		};
		sorted(&self.transfers) == sorted(other)
	}
}

impl PartialOrd for Bundle {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Bundle {
	fn cmp(&self, other: &Self) -> Ordering {
		(self.source_block_number, self.index_in_block)
			.cmp(&(other.source_block_number, other.index_in_block))
			.then_with(|| self.bundle_hash.cmp(&other.bundle_hash))
	}
}

/// Signature over a bundle hash by one signatory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleSignature {
	pub signer: Address,
	/// 65-byte r ‖ s ‖ v signature.
	pub signature: Bytes,
}

/// Destination transaction carrying a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTx {
	/// Destination tip height at the time of submission.
	pub block_number: u64,
	pub tx_hash: B256,
	pub from: Address,
	pub nonce: u64,
}

/// Lifecycle states of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BundleState {
	Bundled,
	Stored,
	Signed,
	Submitted,
	Sealed,
	Finalized,
}

impl fmt::Display for BundleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			BundleState::Bundled => "BUNDLED",
			BundleState::Stored => "STORED",
			BundleState::Signed => "SIGNED",
			BundleState::Submitted => "SUBMITTED",
			BundleState::Sealed => "SEALED",
			BundleState::Finalized => "FINALIZED",
		};
		f.write_str(name)
	}
}

/// A bundle plus everything the pipeline has learned about it.
///
/// Owned by exactly one pipeline stage at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulBundle {
	bundle_id: u64,
	bundle: Bundle,
	state: BundleState,
	signatures: Vec<BundleSignature>,
	submitted: Option<SubmittedTx>,
	receipt: Option<Receipt>,
}

impl StatefulBundle {
	pub fn new(bundle_id: u64, bundle: Bundle) -> Self {
		Self {
			bundle_id,
			bundle,
			state: BundleState::Bundled,
			signatures: Vec::new(),
			submitted: None,
			receipt: None,
		}
	}

	pub fn id(&self) -> u64 {
		self.bundle_id
	}

	pub fn bundle(&self) -> &Bundle {
		&self.bundle
	}

	pub fn state(&self) -> BundleState {
		self.state
	}

	pub fn bundle_hash(&self) -> &B256 {
		self.bundle.bundle_hash()
	}

	pub fn transfers(&self) -> &[Transfer] {
		self.bundle.transfers()
	}

	pub fn signatures(&self) -> &[BundleSignature] {
		&self.signatures
	}

	pub fn submitted_tx(&self) -> Option<&SubmittedTx> {
		self.submitted.as_ref()
	}

	pub fn receipt(&self) -> Option<&Receipt> {
		self.receipt.as_ref()
	}

	fn advance(&mut self, from: BundleState, to: BundleState) -> Result<(), BundleStateError> {
		if self.state != from {
			return Err(BundleStateError::InvalidTransition {
				from: self.state,
				to,
			});
		}
		self.state = to;
		Ok(())
	}

	/// Marks the bundle as durably persisted.
	pub fn set_stored(&mut self) -> Result<(), BundleStateError> {
		self.advance(BundleState::Bundled, BundleState::Stored)
	}

	pub fn set_signed(&mut self, signatures: Vec<BundleSignature>) -> Result<(), BundleStateError> {
		self.advance(BundleState::Stored, BundleState::Signed)?;
		self.signatures = signatures;
		Ok(())
	}

	pub fn set_submitted(&mut self, tx: SubmittedTx) -> Result<(), BundleStateError> {
		self.advance(BundleState::Signed, BundleState::Submitted)?;
		self.submitted = Some(tx);
		Ok(())
	}

	/// Points the bundle at a different destination transaction that already
	/// carried it.
	pub fn rebind_tx_hash(&mut self, tx_hash: B256) -> Result<(), BundleStateError> {
		match (self.state, self.submitted.as_mut()) {
			(BundleState::Submitted, Some(tx)) => {
				tx.tx_hash = tx_hash;
				Ok(())
			},
			(state, _) => Err(BundleStateError::InvalidOperation {
				state,
				operation: "rebind_tx_hash",
			}),
		}
	}

	/// Records the destination receipt confirmed at minimum depth.
	pub fn set_sealed(&mut self, receipt: Receipt) -> Result<(), BundleStateError> {
		self.advance(BundleState::Submitted, BundleState::Sealed)?;
		self.receipt = Some(receipt);
		Ok(())
	}

	/// Replaces the receipt of a sealed bundle after a destination reorg.
	pub fn reset_sealed(&mut self, receipt: Receipt) -> Result<(), BundleStateError> {
		if self.state != BundleState::Sealed {
			return Err(BundleStateError::InvalidOperation {
				state: self.state,
				operation: "reset_sealed",
			});
		}
		self.receipt = Some(receipt);
		Ok(())
	}

	pub fn set_finalized(&mut self) -> Result<(), BundleStateError> {
		self.advance(BundleState::Sealed, BundleState::Finalized)
	}

	/// One-line summary for critical error reports.
	pub fn error_string(&self) -> String {
		let tx_hash = self
			.submitted
			.as_ref()
			.map(|tx| tx.tx_hash.to_string())
			.unwrap_or_else(|| "none".to_string());
		format!(
			"bundle_id={} state={} bundle_hash={} source_block={} index={} transfers={} tx_hash={}",
			self.bundle_id,
			self.state,
			self.bundle.bundle_hash(),
			self.bundle.source_block_number(),
			self.bundle.index_in_block(),
			self.bundle.transfers().len(),
			tx_hash
		)
	}
}

impl fmt::Display for StatefulBundle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"#{} ({}, {})",
			self.bundle_id,
			short_hash(self.bundle.bundle_hash()),
			self.state
		)
	}
}
