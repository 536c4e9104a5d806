//! Where a source deposit is in the relay.

use super::ApiError;
use relay_storage::StorageService;
use relay_types::{Address, BundleState, StatefulBundle, B256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Query string of the transaction and batch endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionQuery {
	pub source_tx_hash: String,
}

/// Relay state of a source deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
	/// No bundle carries the deposit, yet.
	NotFound,
	Stored,
	Signed,
	Submitted,
	Sealed,
	Finalized,
}

impl From<BundleState> for TransferStatus {
	fn from(state: BundleState) -> Self {
		match state {
			BundleState::Bundled | BundleState::Stored => TransferStatus::Stored,
			BundleState::Signed => TransferStatus::Signed,
			BundleState::Submitted => TransferStatus::Submitted,
			BundleState::Sealed => TransferStatus::Sealed,
			BundleState::Finalized => TransferStatus::Finalized,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
	pub state: TransferStatus,
	pub bundle: Option<BundleInfo>,
	pub destination: Option<DestinationInfo>,
}

/// The bundle carrying a deposit and the deposit's transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
	pub bundle_id: u64,
	pub bundle_hash: B256,
	pub source_block_number: u64,
	pub source_block_hash: B256,
	pub index_in_block: u32,
	pub recipient: Address,
	/// Destination units, as a decimal string.
	pub amount: String,
}

/// Destination transaction of a bundle. Block fields are set once a receipt
/// was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
	pub tx_hash: B256,
	pub block_number: Option<u64>,
	pub block_hash: Option<B256>,
}

/// A deposit together with the destination tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
	#[serde(flatten)]
	pub transaction: TransactionResponse,
	pub destination_latest_block: Option<u64>,
}

fn parse_hash(raw: &str) -> Result<B256, ApiError> {
	let trimmed = raw.trim();
	let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
	if hex.len() != 64 {
		return Err(ApiError::InvalidHash(format!(
			"expected 32 bytes of hex, got {} characters",
			hex.len()
		)));
	}
	B256::from_str(hex).map_err(|e| ApiError::InvalidHash(e.to_string()))
}

fn describe(bundle: &StatefulBundle, source_tx_hash: &B256) -> TransactionResponse {
	let transfer = bundle
		.transfers()
		.iter()
		.find(|t| &t.source_tx_hash == source_tx_hash);
	let info = transfer.map(|t| BundleInfo {
		bundle_id: bundle.id(),
		bundle_hash: *bundle.bundle_hash(),
		source_block_number: bundle.bundle().source_block_number(),
		source_block_hash: *bundle.bundle().source_block_hash(),
		index_in_block: bundle.bundle().index_in_block(),
		recipient: t.recipient,
		amount: t.amount.to_string(),
	});

	let destination = match (bundle.receipt(), bundle.submitted_tx()) {
		(Some(receipt), _) => Some(DestinationInfo {
			tx_hash: receipt.transaction_hash,
			block_number: Some(receipt.block_number),
			block_hash: Some(receipt.block_hash),
		}),
		(None, Some(tx)) => Some(DestinationInfo {
			tx_hash: tx.tx_hash,
			block_number: None,
			block_hash: None,
		}),
		(None, None) => None,
	};

	TransactionResponse {
		state: bundle.state().into(),
		bundle: info,
		destination,
	}
}

const NOT_FOUND: TransactionResponse = TransactionResponse {
	state: TransferStatus::NotFound,
	bundle: None,
	destination: None,
};

pub async fn get_transaction(storage: &StorageService, raw_hash: &str) -> Result<TransactionResponse, ApiError> {
	let tx_hash = parse_hash(raw_hash)?;
	let Some(bundle_id) = storage.bundle_for_transfer(&tx_hash).await? else {
		return Ok(NOT_FOUND);
	};
	match storage.load_bundle(bundle_id).await? {
		Some(bundle) => Ok(describe(&bundle, &tx_hash)),
		None => {
			tracing::warn!(bundle_id, %tx_hash, "Indexed transfer points at a missing bundle");
			Ok(NOT_FOUND)
		},
	}
}

pub async fn get_batch(
	storage: &StorageService,
	raw_hash: &str,
	destination_chain: &str,
) -> Result<BatchResponse, ApiError> {
	let transaction = get_transaction(storage, raw_hash).await?;
	Ok(BatchResponse {
		transaction,
		destination_latest_block: storage.load_tip(destination_chain).await?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{Bundle, SubmittedTx, Transfer};

	fn storage() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	fn tx(n: u8) -> B256 {
		B256::repeat_byte(n)
	}

	fn stored(id: u64) -> StatefulBundle {
		let transfers = vec![
			Transfer::new(tx(1), Address::repeat_byte(0x11), 1_000),
			Transfer::new(tx(2), Address::repeat_byte(0x12), 2_000),
		];
		let mut bundle = StatefulBundle::new(id, Bundle::new(12, B256::repeat_byte(0xb1), 1, transfers));
		bundle.set_stored().unwrap();
		bundle
	}

	#[test]
	fn test_hash_parsing() {
		assert_eq!(parse_hash(&tx(7).to_string()).unwrap(), tx(7));
		assert_eq!(parse_hash(&tx(7).to_string()[2..]).unwrap(), tx(7));
		assert!(matches!(parse_hash("0x1234"), Err(ApiError::InvalidHash(_))));
		assert!(matches!(parse_hash(&"zz".repeat(32)), Err(ApiError::InvalidHash(_))));
	}

	#[tokio::test]
	async fn test_unknown_transaction_is_not_found() {
		let response = get_transaction(&storage(), &tx(9).to_string()).await.unwrap();
		assert_eq!(response, NOT_FOUND);
	}

	#[tokio::test]
	async fn test_stored_transfer_is_described() {
		let storage = storage();
		let bundle = stored(4);
		storage.store_bundle(&bundle).await.unwrap();
		storage.index_transfers(&bundle).await.unwrap();

		let response = get_transaction(&storage, &tx(2).to_string()).await.unwrap();
		assert_eq!(response.state, TransferStatus::Stored);
		assert!(response.destination.is_none());
		let info = response.bundle.unwrap();
		assert_eq!(info.bundle_id, 4);
		assert_eq!(info.index_in_block, 1);
		assert_eq!(info.recipient, Address::repeat_byte(0x12));
		assert_eq!(info.amount, "2000");
	}

	#[tokio::test]
	async fn test_submitted_transfer_reports_destination_tx() {
		let storage = storage();
		let mut bundle = stored(4);
		bundle.set_signed(Vec::new()).unwrap();
		bundle
			.set_submitted(SubmittedTx {
				block_number: 300,
				tx_hash: tx(0xd0),
				from: Address::repeat_byte(5),
				nonce: 2,
			})
			.unwrap();
		storage.store_bundle(&bundle).await.unwrap();
		storage.index_transfers(&bundle).await.unwrap();
		storage.store_tip("aion", 305).await.unwrap();

		let batch = get_batch(&storage, &tx(1).to_string(), "aion").await.unwrap();
		assert_eq!(batch.transaction.state, TransferStatus::Submitted);
		assert_eq!(
			batch.transaction.destination,
			Some(DestinationInfo {
				tx_hash: tx(0xd0),
				block_number: None,
				block_hash: None,
			})
		);
		assert_eq!(batch.destination_latest_block, Some(305));

		let json = serde_json::to_value(&batch).unwrap();
		assert_eq!(json["state"], "SUBMITTED");
		assert_eq!(json["destination_latest_block"], 305);
	}

	#[tokio::test]
	async fn test_invalid_hash_is_rejected_before_lookup() {
		assert!(matches!(
			get_batch(&storage(), "not-a-hash", "aion").await,
			Err(ApiError::InvalidHash(_))
		));
	}
}
