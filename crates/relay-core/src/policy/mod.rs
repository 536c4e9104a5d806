//! Translation between chain receipts and transfer bundles.
//!
//! The bundling policy reads deposits out of source receipts; the
//! unbundling policy reads the transfers a destination receipt paid out.

use relay_chain::ChainError;
use thiserror::Error;

pub mod bundling;
pub mod unbundling;

pub use bundling::BundlingPolicy;
pub use unbundling::UnbundlingPolicy;

/// Errors raised while decoding bridge events.
#[derive(Debug, Error)]
pub enum PolicyError {
	/// The receipts could not be matched against their block.
	#[error(transparent)]
	Chain(#[from] ChainError),
	#[error("Malformed deposit in transaction {tx_hash}: {reason}")]
	MalformedDeposit { tx_hash: String, reason: String },
	#[error("{event} event has {actual} topics, expected {expected}")]
	TopicCount {
		event: &'static str,
		expected: usize,
		actual: usize,
	},
	#[error("Malformed payout in transaction {tx_hash}: {reason}")]
	MalformedPayout { tx_hash: String, reason: String },
	#[error("Invalid policy settings: {0}")]
	InvalidSettings(String),
}
