//! Matches submitted bundles with their destination receipts.
//!
//! A submitted bundle is sealed once a receipt for it sits `min_depth`
//! blocks under the tip and pays out exactly the bundle's transfers. When
//! the submitted transaction has no receipt, the bridge contract is asked
//! whether another transaction already carried the bundle; if so the bundle
//! is rebound to that transaction. A receipt may also be a marker pointing
//! at the transaction that originally included the bundle, in which case
//! the original receipt is the one sealed.
//!
//! Anything else means the relay lost track of a bundle and is critical.

use super::{depth, fetch_receipt, verify_unbundled, Stage, Step};
use crate::policy::UnbundlingPolicy;
use crate::retry::RetryExecutor;
use crate::CriticalError;
use async_trait::async_trait;
use relay_chain::ChainConnection;
use relay_delivery::DeliveryService;
use relay_storage::StorageService;
use relay_types::{Address, EventFilter, Receipt, StatefulBundle, B256};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

const WORKER: &str = "collect_receipts";

/// Topics of the included marker event: its signature and the hash of the
/// transaction that first included the bundle. The marker is recognized by
/// this exact count, so a contract upgrade that adds topics to the event
/// must update it.
pub const INCLUDED_MARKER_TOPIC_COUNT: usize = 2;

pub struct CollectReceiptsStage {
	connection: Arc<dyn ChainConnection>,
	delivery: Arc<DeliveryService>,
	storage: Arc<StorageService>,
	tip: watch::Receiver<Option<u64>>,
	retry: RetryExecutor<Option<Receipt>>,
	unbundling: UnbundlingPolicy,
	included: EventFilter,
	bridge_contract: Address,
	min_depth: u64,
}

impl CollectReceiptsStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		connection: Arc<dyn ChainConnection>,
		delivery: Arc<DeliveryService>,
		storage: Arc<StorageService>,
		tip: watch::Receiver<Option<u64>>,
		retry: RetryExecutor<Option<Receipt>>,
		unbundling: UnbundlingPolicy,
		included: EventFilter,
		min_depth: u64,
	) -> Self {
		let bridge_contract = *included.contract_address();
		Self {
			connection,
			delivery,
			storage,
			tip,
			retry,
			unbundling,
			included,
			bridge_contract,
			min_depth,
		}
	}

	/// Hash of the original transaction when `receipt` is an included marker.
	fn included_marker(&self, receipt: &Receipt) -> Option<B256> {
		if !self.included.matches(&receipt.logs_bloom) || receipt.to != Some(self.bridge_contract) {
			return None;
		}
		let log = receipt.logs.first()?;
		if log.topics.len() != INCLUDED_MARKER_TOPIC_COUNT || log.topics[0] != *self.included.event_hash() {
			return None;
		}
		Some(log.topics[1])
	}

	async fn seal(&self, bundle: &mut StatefulBundle, receipt: Receipt) -> Result<Step, CriticalError> {
		let block = receipt.block_number;
		bundle
			.set_sealed(receipt)
			.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
		self.storage
			.store_bundle(bundle)
			.await
			.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to persist: {}", e)))?;
		tracing::info!(block, "Sealed bundle");
		Ok(Step::Advance)
	}
}

#[async_trait]
impl Stage for CollectReceiptsStage {
	fn name(&self) -> &'static str {
		WORKER
	}

	#[instrument(skip_all, fields(bundle_id = bundle.id()))]
	async fn process(&mut self, bundle: &mut StatefulBundle) -> Result<Step, CriticalError> {
		let tip = *self.tip.borrow();
		let Some(tip) = tip else {
			return Ok(Step::Wait);
		};
		let Some(submitted) = bundle.submitted_tx().cloned() else {
			return Err(CriticalError::bundle(WORKER, bundle, "Bundle has no submitted transaction"));
		};
		if depth(tip, submitted.block_number).is_none_or(|d| d < self.min_depth) {
			return Ok(Step::Wait);
		}

		let Some(receipt) = fetch_receipt(self.connection.as_ref(), &self.retry, submitted.tx_hash).await else {
			let included = self
				.delivery
				.included_tx_hash(*bundle.bundle_hash())
				.await
				.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to query inclusion: {}", e)))?;
			let Some(tx_hash) = included else {
				return Err(CriticalError::bundle(WORKER, bundle, "Failed to retrieve the receipt"));
			};
			tracing::info!(
				submitted = %submitted.tx_hash,
				included = %tx_hash,
				"Bundle included by another transaction"
			);
			bundle
				.rebind_tx_hash(tx_hash)
				.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
			return Ok(Step::Again);
		};

		if depth(tip, receipt.block_number).is_none_or(|d| d < self.min_depth) {
			return Ok(Step::Wait);
		}

		if !receipt.status {
			return Err(CriticalError::bundle(
				WORKER,
				bundle,
				format!("Transaction {} failed on the destination chain", receipt.transaction_hash),
			));
		}

		if receipt.logs.len() == bundle.transfers().len() + 1 {
			verify_unbundled(WORKER, &self.unbundling, bundle, &receipt)?;
			return self.seal(bundle, receipt).await;
		}

		if let Some(original) = self.included_marker(&receipt) {
			tracing::info!(
				marker = %receipt.transaction_hash,
				original = %original,
				"Receipt points at the original inclusion"
			);
			bundle
				.rebind_tx_hash(original)
				.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
			let Some(original_receipt) = fetch_receipt(self.connection.as_ref(), &self.retry, original).await else {
				return Err(CriticalError::bundle(WORKER, bundle, "Failed to retrieve the original receipt"));
			};
			return self.seal(bundle, original_receipt).await;
		}

		Err(CriticalError::bundle(
			WORKER,
			bundle,
			format!(
				"Receipt {} has {} logs for {} transfers",
				receipt.transaction_hash,
				receipt.logs.len(),
				bundle.transfers().len()
			),
		))
	}
}
