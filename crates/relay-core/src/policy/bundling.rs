//! Source receipts to bundles.

use super::PolicyError;
use relay_chain::processor::{filter_block, filter_receipts};
use relay_config::{BundlingConfig, ChainConfig};
use relay_signer::BundleSource;
use relay_types::{Address, Block, Bundle, EventFilter, Receipt, Transfer};

/// Default number of transfers carried by one bundle.
pub const TRANSFERS_PER_BUNDLE: usize = 20;

/// Reads deposit events and groups them into bundles per block.
///
/// A deposit log carries the recipient word in `topics[2]` and the amount as
/// a 32-byte data word whose upper 16 bytes must be zero. Amounts are scaled
/// by `10^amount_scale_exponent` into destination units.
#[derive(Debug, Clone)]
pub struct BundlingPolicy {
	filter: EventFilter,
	transfers_per_bundle: usize,
	amount_scale: u128,
}

impl BundlingPolicy {
	pub fn new(
		filter: EventFilter,
		transfers_per_bundle: usize,
		amount_scale_exponent: u32,
	) -> Result<Self, PolicyError> {
		if transfers_per_bundle == 0 {
			return Err(PolicyError::InvalidSettings(
				"transfers_per_bundle must be greater than zero".into(),
			));
		}
		let amount_scale = 10u128.checked_pow(amount_scale_exponent).ok_or_else(|| {
			PolicyError::InvalidSettings(format!(
				"amount_scale_exponent {} overflows a 128-bit amount",
				amount_scale_exponent
			))
		})?;
		Ok(Self {
			filter,
			transfers_per_bundle,
			amount_scale,
		})
	}

	/// Policy for the deposit event of `chain`'s bridge contract.
	pub fn from_config(chain: &ChainConfig, settings: &BundlingConfig) -> Result<Self, PolicyError> {
		Self::new(
			EventFilter::new(chain.hasher, chain.bridge_contract, &settings.deposit_event),
			settings.transfers_per_bundle,
			settings.amount_scale_exponent,
		)
	}

	pub fn filter(&self) -> &EventFilter {
		&self.filter
	}

	/// Bundles a block from its full receipt set.
	pub fn from_unfiltered_block(&self, block: &Block, receipts: &[Receipt]) -> Result<Vec<Bundle>, PolicyError> {
		if !filter_block(block, &self.filter) {
			return Ok(Vec::new());
		}
		let filtered = filter_receipts(block, receipts, &self.filter)?;
		self.from_filtered_receipts(block, filtered)
	}

	/// Bundles receipts already reduced to matching deposit logs.
	pub fn from_filtered_receipts(
		&self,
		block: &Block,
		mut receipts: Vec<Receipt>,
	) -> Result<Vec<Bundle>, PolicyError> {
		receipts.sort_by_key(|r| r.transaction_index);

		let mut transfers = Vec::with_capacity(receipts.len());
		for receipt in &receipts {
			if let Some(transfer) = self.decode_deposit(receipt)? {
				transfers.push(transfer);
			}
		}

		let bundles: Vec<Bundle> = transfers
			.chunks(self.transfers_per_bundle)
			.enumerate()
			.map(|(index, chunk)| Bundle::new(block.number, block.hash, index as u32, chunk.to_vec()))
			.collect();

		if !bundles.is_empty() {
			tracing::debug!(
				block = block.number,
				transfers = transfers.len(),
				bundles = bundles.len(),
				"Bundled deposits"
			);
		}
		Ok(bundles)
	}

	/// Decodes the first deposit log of a receipt. Zero deposits are skipped.
	fn decode_deposit(&self, receipt: &Receipt) -> Result<Option<Transfer>, PolicyError> {
		let malformed = |reason: String| PolicyError::MalformedDeposit {
			tx_hash: receipt.transaction_hash.to_string(),
			reason,
		};

		let Some(log) = receipt.logs.iter().find(|log| self.filter.matches_log(log)) else {
			return Ok(None);
		};
		if log.data.len() != 32 {
			return Err(malformed(format!("data is {} bytes, expected 32", log.data.len())));
		}
		if log.data.iter().all(|b| *b == 0) {
			tracing::debug!(tx_hash = %receipt.transaction_hash, "Skipping zero deposit");
			return Ok(None);
		}
		if log.data[..16].iter().any(|b| *b != 0) {
			return Err(malformed("amount exceeds 128 bits".into()));
		}
		let recipient = log
			.topic(2)
			.ok_or_else(|| malformed(format!("{} topics, recipient missing", log.topics.len())))?;

		let mut low = [0u8; 16];
		low.copy_from_slice(&log.data[16..]);
		let amount = u128::from_be_bytes(low)
			.checked_mul(self.amount_scale)
			.ok_or_else(|| malformed("scaled amount overflows".into()))?;

		Ok(Some(Transfer::new(
			receipt.transaction_hash,
			Address::from_word(*recipient),
			amount,
		)))
	}
}

impl BundleSource for BundlingPolicy {
	fn bundles_in_block(&self, block: &Block, receipts: &[Receipt]) -> Result<Vec<Bundle>, String> {
		self.from_unfiltered_block(block, receipts).map_err(|e| e.to_string())
	}
}
