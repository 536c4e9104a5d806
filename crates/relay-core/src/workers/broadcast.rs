//! Submits signed bundles to the destination bridge.

use super::{Stage, Step};
use crate::retry::RetryExecutor;
use crate::CriticalError;
use async_trait::async_trait;
use relay_delivery::DeliveryService;
use relay_storage::StorageService;
use relay_types::{BundleState, StatefulBundle, SubmittedTx};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

const WORKER: &str = "broadcast";

pub struct BroadcastStage {
	delivery: Arc<DeliveryService>,
	storage: Arc<StorageService>,
	tip: watch::Receiver<Option<u64>>,
	retry: RetryExecutor<SubmittedTx>,
}

impl BroadcastStage {
	pub fn new(
		delivery: Arc<DeliveryService>,
		storage: Arc<StorageService>,
		tip: watch::Receiver<Option<u64>>,
		retry: RetryExecutor<SubmittedTx>,
	) -> Self {
		Self {
			delivery,
			storage,
			tip,
			retry,
		}
	}
}

#[async_trait]
impl Stage for BroadcastStage {
	fn name(&self) -> &'static str {
		WORKER
	}

	#[instrument(skip_all, fields(bundle_id = bundle.id()))]
	async fn process(&mut self, bundle: &mut StatefulBundle) -> Result<Step, CriticalError> {
		if bundle.state() != BundleState::Signed {
			return Err(CriticalError::bundle(WORKER, bundle, "Bundle is not in signed state"));
		}
		// The submission height anchors the inclusion depth check.
		let tip = *self.tip.borrow();
		let Some(tip) = tip else {
			return Ok(Step::Wait);
		};

		let target: &StatefulBundle = bundle;
		let delivery = &self.delivery;
		let submitted = self
			.retry
			.execute(|| delivery.submit_bundle(target, tip))
			.await
			.ok_or_else(|| CriticalError::bundle(WORKER, bundle, "Failed to submit bundle"))?;

		let tx_hash = submitted.tx_hash;
		bundle
			.set_submitted(submitted)
			.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
		self.storage
			.store_bundle(bundle)
			.await
			.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to persist: {}", e)))?;

		tracing::debug!(tx_hash = %tx_hash, tip, "Recorded submission");
		Ok(Step::Advance)
	}
}
