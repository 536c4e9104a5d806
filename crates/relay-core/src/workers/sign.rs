//! Collects signatory signatures for stored bundles.
//!
//! A bundle is only signed after it was rebuilt from the source chain. A
//! bundle the source chain disagrees with stops the relay.

use super::{Stage, Step};
use crate::retry::RetryExecutor;
use crate::CriticalError;
use async_trait::async_trait;
use relay_signer::{SignatoryCollector, Verdict};
use relay_storage::StorageService;
use relay_types::{BundleSignature, BundleState, StatefulBundle};
use std::sync::Arc;
use tracing::instrument;

const WORKER: &str = "sign";

pub struct SignStage {
	signers: Arc<SignatoryCollector>,
	storage: Arc<StorageService>,
	validation: RetryExecutor<Verdict>,
	retry: RetryExecutor<Vec<BundleSignature>>,
}

impl SignStage {
	pub fn new(
		signers: Arc<SignatoryCollector>,
		storage: Arc<StorageService>,
		validation: RetryExecutor<Verdict>,
		retry: RetryExecutor<Vec<BundleSignature>>,
	) -> Self {
		Self {
			signers,
			storage,
			validation,
			retry,
		}
	}
}

#[async_trait]
impl Stage for SignStage {
	fn name(&self) -> &'static str {
		WORKER
	}

	#[instrument(skip_all, fields(bundle_id = bundle.id()))]
	async fn process(&mut self, bundle: &mut StatefulBundle) -> Result<Step, CriticalError> {
		if bundle.state() != BundleState::Stored {
			return Err(CriticalError::bundle(WORKER, bundle, "Bundle is not in stored state"));
		}

		let target: &StatefulBundle = bundle;
		let verdict = self
			.validation
			.execute(|| self.signers.check_source(target))
			.await
			.ok_or_else(|| CriticalError::bundle(WORKER, bundle, "Failed to check bundle against source chain"))?;
		if let Err(rejection) = verdict {
			return Err(CriticalError::bundle(
				WORKER,
				bundle,
				format!("Source chain rejects bundle: {}", rejection),
			));
		}

		let signatures = self
			.retry
			.execute(|| self.signers.signatures_for_bundle(target))
			.await
			.ok_or_else(|| CriticalError::bundle(WORKER, bundle, "Failed to collect signatures"))?;

		let count = signatures.len();
		bundle
			.set_signed(signatures)
			.map_err(|e| CriticalError::bundle(WORKER, bundle, e.to_string()))?;
		self.storage
			.store_bundle(bundle)
			.await
			.map_err(|e| CriticalError::bundle(WORKER, bundle, format!("Failed to persist: {}", e)))?;

		tracing::info!(signatures = count, "Signed bundle");
		Ok(Step::Advance)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::retry::{signatures_unusable, RetryBuilder};
	use crate::workers::test_support::*;
	use relay_chain::testing::{block, block_hash, receipt, MockConnection};
	use relay_signer::implementations::local::LocalSigner;
	use relay_signer::{BundleSource, BundleValidator, SignerInterface};
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{Block, Bundle, Receipt, B256};
	use std::time::Duration;

	const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

	/// Rebuilds whatever bundle the source block is expected to hold.
	struct Rebuilds(Vec<Bundle>);

	impl BundleSource for Rebuilds {
		fn bundles_in_block(&self, _block: &Block, _receipts: &[Receipt]) -> Result<Vec<Bundle>, String> {
			Ok(self.0.clone())
		}
	}

	fn collector() -> SignatoryCollector {
		let signer: Arc<dyn SignerInterface> = Arc::new(LocalSigner::new(KEY).unwrap());
		SignatoryCollector::new(vec![signer], 1, Duration::from_secs(1)).unwrap()
	}

	/// A source chain holding the block of `stored_bundle`, rebuilt as `rebuilt`.
	fn validated(source: Arc<MockConnection>, rebuilt: Vec<Bundle>) -> SignatoryCollector {
		collector().with_validator(Arc::new(BundleValidator::new(source, Arc::new(Rebuilds(rebuilt)))))
	}

	fn stage(storage: Arc<StorageService>) -> SignStage {
		stage_with(storage, collector())
	}

	fn stage_with(storage: Arc<StorageService>, collector: SignatoryCollector) -> SignStage {
		SignStage::new(
			Arc::new(collector),
			storage,
			RetryBuilder::new("source check")
				.max_attempts(2)
				.sleep(Duration::from_millis(1))
				.build(),
			RetryBuilder::new("signatures")
				.max_attempts(2)
				.sleep(Duration::from_millis(1))
				.reject_if(signatures_unusable)
				.build(),
		)
	}

	#[tokio::test]
	async fn test_stored_bundle_is_signed_and_persisted() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut stage = stage(storage.clone());
		let mut bundle = stored_bundle(1);

		assert_eq!(stage.process(&mut bundle).await.unwrap(), Step::Advance);
		assert_eq!(bundle.state(), BundleState::Signed);
		assert_eq!(bundle.signatures().len(), 1);
		let persisted = storage.load_bundle(1).await.unwrap().unwrap();
		assert_eq!(persisted.state(), BundleState::Signed);
	}

	/// Source chain holding `bundle`'s block at its recorded hash.
	fn source_for(bundle: &StatefulBundle) -> Arc<MockConnection> {
		let number = bundle.bundle().source_block_number();
		let mut b = block(number, block_hash(number.saturating_sub(1)), vec![B256::repeat_byte(0x31)]);
		b.hash = *bundle.bundle().source_block_hash();
		let conn = Arc::new(MockConnection::new("source"));
		conn.insert_receipt(receipt(&b, B256::repeat_byte(0x31), 0, vec![]));
		conn.push_block(b);
		conn
	}

	#[tokio::test]
	async fn test_bundle_matching_source_is_signed() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut bundle = stored_bundle(1);
		let source = source_for(&bundle);
		let mut stage = stage_with(storage, validated(source, vec![bundle.bundle().clone()]));

		assert_eq!(stage.process(&mut bundle).await.unwrap(), Step::Advance);
		assert_eq!(bundle.state(), BundleState::Signed);
	}

	#[tokio::test]
	async fn test_bundle_rejected_by_source_is_critical() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut bundle = stored_bundle(1);
		let source = source_for(&bundle);
		let mut stage = stage_with(storage.clone(), validated(source, Vec::new()));

		let err = stage.process(&mut bundle).await.unwrap_err();
		assert_eq!(err.worker, "sign");
		assert!(err.message.contains("Source chain rejects bundle"));
		assert_eq!(bundle.state(), BundleState::Stored);
		assert!(storage.load_bundle(1).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_unreachable_source_is_critical_after_retries() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut bundle = stored_bundle(1);
		let source = source_for(&bundle);
		source.set_failing(true);
		let mut stage = stage_with(storage, validated(source.clone(), vec![bundle.bundle().clone()]));

		let err = stage.process(&mut bundle).await.unwrap_err();
		assert!(err.message.contains("Failed to check bundle"));
		assert_eq!(source.call_count(), 2);
	}

	#[tokio::test]
	async fn test_wrong_state_is_critical() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mut stage = stage(storage);
		let mut bundle = signed_bundle(1);
		let err = stage.process(&mut bundle).await.unwrap_err();
		assert_eq!(err.worker, "sign");
	}
}
