//! Startup recovery of unfinished bundles.
//!
//! Every bundle with an id after the last finalized one is loaded from
//! storage and routed to the stage that owns its state, so the pipeline
//! resumes exactly where it stopped.

use crate::RelayError;
use relay_storage::StorageService;
use relay_types::{BundleState, StatefulBundle};
use std::sync::Arc;
use tracing::instrument;

/// Unfinished bundles grouped by the stage that resumes them, each in id
/// order.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	pub to_sign: Vec<StatefulBundle>,
	pub to_broadcast: Vec<StatefulBundle>,
	pub to_collect: Vec<StatefulBundle>,
	pub to_finalize: Vec<StatefulBundle>,
	/// Bundles already finalized whose progress marker was not yet written.
	pub already_finalized: usize,
}

impl RecoveryReport {
	pub fn total(&self) -> usize {
		self.to_sign.len() + self.to_broadcast.len() + self.to_collect.len() + self.to_finalize.len()
	}
}

pub struct RecoveryService {
	storage: Arc<StorageService>,
}

impl RecoveryService {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Loads bundles in `(last_finalized, next_bundle_id)` and routes them.
	///
	/// Stages hand bundles on in id order, so states never increase along
	/// the ids. A bundle further along than its predecessor, or one that was
	/// never stored, means the store is inconsistent and recovery fails.
	#[instrument(skip_all)]
	pub async fn recover(&self) -> Result<RecoveryReport, RelayError> {
		let storage_error = |e: relay_storage::StorageError| RelayError::Storage(e.to_string());
		let last_finalized = self.storage.last_finalized().await.map_err(storage_error)?;
		let next_id = self.storage.next_bundle_id().await.map_err(storage_error)?;
		let from = last_finalized + 1;

		let bundles = self
			.storage
			.load_bundles(from, next_id)
			.await
			.map_err(|e| RelayError::Recovery(e.to_string()))?;

		let mut report = RecoveryReport::default();
		let mut previous: Option<(u64, BundleState)> = None;
		for bundle in bundles {
			if let Some((id, state)) = previous {
				if bundle.state() > state {
					return Err(RelayError::Recovery(format!(
						"Bundle {} is {} but the earlier bundle {} is only {}",
						bundle.id(),
						bundle.state(),
						id,
						state
					)));
				}
			}
			previous = Some((bundle.id(), bundle.state()));

			match bundle.state() {
				BundleState::Bundled => {
					return Err(RelayError::Recovery(format!(
						"Bundle {} was persisted before it was stored",
						bundle.id()
					)));
				},
				BundleState::Stored => report.to_sign.push(bundle),
				BundleState::Signed => report.to_broadcast.push(bundle),
				BundleState::Submitted => report.to_collect.push(bundle),
				BundleState::Sealed => report.to_finalize.push(bundle),
				BundleState::Finalized => {
					tracing::debug!(bundle_id = bundle.id(), "Skipping finalized bundle");
					report.already_finalized += 1;
				},
			}
		}

		tracing::info!(
			from,
			next_id,
			sign = report.to_sign.len(),
			broadcast = report.to_broadcast.len(),
			collect = report.to_collect.len(),
			finalize = report.to_finalize.len(),
			"Recovered unfinished bundles"
		);
		Ok(report)
	}
}
