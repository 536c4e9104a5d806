//! Finalizes sealed bundles once their receipts are deep enough.

use super::{depth, fetch_receipt, verify_unbundled, Stage, Step};
use crate::policy::UnbundlingPolicy;
use crate::retry::RetryExecutor;
use crate::CriticalError;
use async_trait::async_trait;
use relay_chain::ChainConnection;
use relay_storage::StorageService;
use relay_types::{short_hash, Receipt, StatefulBundle};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

const WORKER: &str = "finalize";

/// Re-reads the receipt of the head sealed bundle until it is
/// `finalization_depth` blocks deep, following reorgs that move it.
pub struct FinalizeStage {
	connection: Arc<dyn ChainConnection>,
	storage: Arc<StorageService>,
	tip: watch::Receiver<Option<u64>>,
	retry: RetryExecutor<Option<Receipt>>,
	unbundling: UnbundlingPolicy,
	finalization_depth: u64,
}

impl FinalizeStage {
	pub fn new(
		connection: Arc<dyn ChainConnection>,
		storage: Arc<StorageService>,
		tip: watch::Receiver<Option<u64>>,
		retry: RetryExecutor<Option<Receipt>>,
		unbundling: UnbundlingPolicy,
		finalization_depth: u64,
	) -> Self {
		Self {
			connection,
			storage,
			tip,
			retry,
			unbundling,
			finalization_depth,
		}
	}
}

#[async_trait]
impl Stage for FinalizeStage {
	fn name(&self) -> &'static str {
		WORKER
	}

	#[instrument(skip_all, fields(bundle_id = bundle.id()))]
	async fn process(&mut self, bundle: &mut StatefulBundle) -> Result<Step, CriticalError> {
		let tip = *self.tip.borrow();
		let Some(tip) = tip else {
			return Ok(Step::Wait);
		};
		let Some(tx_hash) = bundle.submitted_tx().map(|tx| tx.tx_hash) else {
			return Err(CriticalError::bundle(WORKER, bundle, "Bundle has no submitted transaction"));
		};

		let Some(receipt) = fetch_receipt(self.connection.as_ref(), &self.retry, tx_hash).await else {
			return Err(CriticalError::bundle(
				WORKER,
				bundle,
				"Receipt no longer available, possible deep reorganization",
			));
		};
		// The tip trails the fastest nodes, so a receipt above it is not yet
		// countable rather than wrong.
		let Some(receipt_depth) = depth(tip, receipt.block_number) else {
			tracing::debug!(block = receipt.block_number, tip, "Receipt is ahead of the tracked tip");
			return Ok(Step::Wait);
		};
		if receipt_depth < self.finalization_depth {
			return Ok(Step::Wait);
		}

		if bundle.receipt() != Some(&receipt) {
			tracing::info!(
				block = receipt.block_number,
				block_hash = %short_hash(&receipt.block_hash),
				"Receipt changed since sealing"
			);
			bundle
				.reset_sealed(receipt.clone())
				.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
		}

		if !receipt.status {
			return Err(CriticalError::bundle(
				WORKER,
				bundle,
				format!("Transaction {} failed on the destination chain", receipt.transaction_hash),
			));
		}
		verify_unbundled(WORKER, &self.unbundling, bundle, &receipt)?;

		bundle
			.set_finalized()
			.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
		self.storage
			.store_bundle(bundle)
			.await
			.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to persist: {}", e)))?;
		self.storage
			.set_last_finalized(bundle.id())
			.await
			.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to persist progress: {}", e)))?;

		tracing::info!(depth = receipt_depth, "Finalized bundle");
		Ok(Step::Advance)
	}
}
