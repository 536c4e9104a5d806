//! Pipeline of the bridge relay.
//!
//! Deposits found on the source chain are bundled, co-signed, submitted to
//! the destination chain and followed until their receipts are final. Each
//! step is a long-running worker; workers hand bundles to each other over
//! bounded channels and share the destination tip through a watch channel.
//!
//! Failures that leave the relay unable to account for a bundle are
//! [`CriticalError`]s. They stop the worker that hit them and, through the
//! [`RelayEngine`], the whole relay.

use relay_types::StatefulBundle;
use thiserror::Error;

pub mod balance;
pub mod builder;
pub mod engine;
pub mod policy;
pub mod recovery;
pub mod retry;
pub mod tip;
pub mod workers;

pub use builder::{BuilderError, RelayBuilder, RelayFactories};
pub use engine::RelayEngine;

/// Log target that feeds alerting.
pub const ALERT_TARGET: &str = "relay::alert";

/// Errors surfaced by the relay as a whole.
#[derive(Debug, Error)]
pub enum RelayError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Recovery error: {0}")]
	Recovery(String),
	#[error(transparent)]
	Critical(#[from] CriticalError),
}

/// A failure the relay cannot continue from.
///
/// Creating one logs it on [`ALERT_TARGET`].
#[derive(Debug, Clone, Error)]
#[error("Critical failure in {worker}: {message}")]
pub struct CriticalError {
	pub worker: &'static str,
	pub message: String,
}

impl CriticalError {
	pub fn new(worker: &'static str, message: impl Into<String>) -> Self {
		let error = Self {
			worker,
			message: message.into(),
		};
		tracing::error!(target: ALERT_TARGET, worker, message = %error.message, "Critical error");
		error
	}

	/// Critical error about one bundle, carrying its summary.
	pub fn bundle(worker: &'static str, bundle: &StatefulBundle, message: impl AsRef<str>) -> Self {
		Self::new(worker, format!("{} [{}]", message.as_ref(), bundle.error_string()))
	}
}
