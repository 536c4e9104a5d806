//! Source chain check run before a bundle is signed.
//!
//! A signatory only vouches for a bundle it can rebuild itself: the source
//! block must still be on the main chain and bundling its receipts again must
//! yield the same bundle at the same index.

use relay_chain::{ChainConnection, ChainError};
use relay_types::{Block, Bundle, Receipt, B256};
use std::sync::Arc;
use thiserror::Error;

/// Rebuilds the bundles of one source block from its full receipt set.
pub trait BundleSource: Send + Sync {
	fn bundles_in_block(&self, block: &Block, receipts: &[Receipt]) -> Result<Vec<Bundle>, String>;
}

/// Why a bundle does not match the source chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BundleRejection {
	#[error("Source block {0} is not known")]
	UnknownBlock(u64),
	#[error("Source block {number} is {actual}, bundle was built from {expected}")]
	NotOnMainChain { number: u64, expected: B256, actual: B256 },
	#[error("Source block {number} cannot be bundled: {reason}")]
	Undecodable { number: u64, reason: String },
	#[error("Source block {number} has {count} bundles, none at index {index}")]
	IndexOutOfRange { number: u64, index: u32, count: usize },
	#[error("Bundle {index} of source block {number} is {actual}, expected {expected}")]
	Mismatch {
		number: u64,
		index: u32,
		expected: B256,
		actual: B256,
	},
}

/// Outcome of a check the chain answered.
pub type Verdict = Result<(), BundleRejection>;

/// Re-derives bundles from the source chain.
pub struct BundleValidator {
	connection: Arc<dyn ChainConnection>,
	source: Arc<dyn BundleSource>,
}

impl BundleValidator {
	pub fn new(connection: Arc<dyn ChainConnection>, source: Arc<dyn BundleSource>) -> Self {
		Self { connection, source }
	}

	/// Checks `bundle` against the source chain.
	///
	/// `Err` means the chain could not be asked and the check may be repeated;
	/// a rejection is final.
	pub async fn check(&self, bundle: &Bundle) -> Result<Verdict, ChainError> {
		let number = bundle.source_block_number();
		let index = bundle.index_in_block();

		let Some(block) = self.connection.get_block(number).await? else {
			return Ok(Err(BundleRejection::UnknownBlock(number)));
		};
		if block.hash != *bundle.source_block_hash() {
			return Ok(Err(BundleRejection::NotOnMainChain {
				number,
				expected: *bundle.source_block_hash(),
				actual: block.hash,
			}));
		}

		let receipts = self
			.connection
			.get_receipts_for_blocks(std::slice::from_ref(&block))
			.await?
			.pop()
			.map(|fetched| fetched.receipts)
			.unwrap_or_default();
		let derived = match self.source.bundles_in_block(&block, &receipts) {
			Ok(derived) => derived,
			Err(reason) => return Ok(Err(BundleRejection::Undecodable { number, reason })),
		};

		let Some(rebuilt) = derived.get(index as usize) else {
			return Ok(Err(BundleRejection::IndexOutOfRange {
				number,
				index,
				count: derived.len(),
			}));
		};
		if rebuilt.bundle_hash() != bundle.bundle_hash() || !rebuilt.same_transfers(bundle.transfers()) {
			return Ok(Err(BundleRejection::Mismatch {
				number,
				index,
				expected: *bundle.bundle_hash(),
				actual: *rebuilt.bundle_hash(),
			}));
		}

		tracing::debug!(source_block = number, index, "Bundle matches source chain");
		Ok(Ok(()))
	}
}
