//! Relay progress, relayer balance and maintenance flag.

use super::ApiError;
use relay_storage::StorageService;
use relay_types::{BalanceRecord, StatefulBundle};
use serde::{Deserialize, Serialize};

/// Progress on both chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
	pub source: SourceStatus,
	pub destination: DestinationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
	pub chain: String,
	/// Last source block the relay has fully read.
	pub checkpoint_block: Option<u64>,
	pub finalized_bundle_id: u64,
	/// Source block of the last finalized bundle.
	pub finalized_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStatus {
	pub chain: String,
	/// Persisted destination tip, when tip persistence is enabled.
	pub latest_block: Option<u64>,
	pub finalized_bundle_id: u64,
	/// Destination block that included the last finalized bundle.
	pub finalized_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceResponse {
	pub maintenance: bool,
}

async fn last_finalized(storage: &StorageService) -> Result<(u64, Option<StatefulBundle>), ApiError> {
	let id = storage.last_finalized().await?;
	if id == 0 {
		return Ok((0, None));
	}
	Ok((id, storage.load_bundle(id).await?))
}

pub async fn get_status(
	storage: &StorageService,
	source_chain: &str,
	destination_chain: &str,
) -> Result<StatusResponse, ApiError> {
	let (finalized_id, finalized) = last_finalized(storage).await?;
	let checkpoint = storage.source_checkpoint().await?;
	let latest = storage.load_tip(destination_chain).await?;

	Ok(StatusResponse {
		source: SourceStatus {
			chain: source_chain.to_string(),
			checkpoint_block: checkpoint.map(|c| c.number),
			finalized_bundle_id: finalized_id,
			finalized_block: finalized.as_ref().map(|b| b.bundle().source_block_number()),
		},
		destination: DestinationStatus {
			chain: destination_chain.to_string(),
			latest_block: latest,
			finalized_bundle_id: finalized_id,
			finalized_block: finalized
				.as_ref()
				.and_then(|b| b.receipt())
				.map(|r| r.block_number),
		},
	})
}

pub async fn get_balance(storage: &StorageService, destination_chain: &str) -> Result<BalanceRecord, ApiError> {
	storage
		.load_balance(destination_chain)
		.await?
		.ok_or(ApiError::NotObserved("Relayer balance"))
}
