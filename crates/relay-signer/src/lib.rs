//! Bundle co-signing for the bridge relay.
//!
//! Every bundle submitted to the destination chain carries signatures over
//! its bundle hash from a quorum of independent signatories. This crate
//! defines the signatory interface and collects signatures from a set of
//! them, after checking each bundle against the source chain.

use async_trait::async_trait;
use relay_chain::{ChainError, QuorumAggregator};
use relay_types::{Address, BundleSignature, ConfigSchema, ImplementationRegistry, StatefulBundle, B256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod local;
}

pub mod validator;

pub use validator::{BundleRejection, BundleSource, BundleValidator, Verdict};

/// Errors that can occur during signing operations.
#[derive(Debug, Error)]
pub enum SignerError {
	/// Error that occurs when signing operations fail.
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	/// Error that occurs when a cryptographic key is invalid or malformed.
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	/// Too few signatories answered before the deadline.
	#[error("Signature quorum not available: {0}")]
	QuorumNotAvailable(String),
	#[error("Invalid configuration: {0}")]
	InvalidConfiguration(String),
}

impl From<ChainError> for SignerError {
	fn from(err: ChainError) -> Self {
		match err {
			ChainError::QuorumNotAvailable { .. } => SignerError::QuorumNotAvailable(err.to_string()),
			other => SignerError::InvalidConfiguration(other.to_string()),
		}
	}
}

/// A signatory able to sign 32-byte digests.
#[async_trait]
pub trait SignerInterface: Send + Sync {
	/// Returns the configuration schema for this signer implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Address recovered from this signatory's signatures.
	fn address(&self) -> Address;

	/// Signs `digest` as is, without any message prefix.
	async fn sign_digest(&self, digest: &B256) -> Result<BundleSignature, SignerError>;
}

/// Type alias for signer factory functions.
pub type SignerFactory = fn(&toml::Value) -> Result<Box<dyn SignerInterface>, SignerError>;

/// Registry trait for signer implementations.
pub trait SignerRegistry: ImplementationRegistry<Factory = SignerFactory> {}

/// Get all registered signer implementations.
pub fn get_all_implementations() -> Vec<(&'static str, SignerFactory)> {
	use implementations::local;

	vec![(local::Registry::NAME, local::Registry::factory())]
}

/// Default deadline for one signature round.
pub const DEFAULT_SIGNATURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Collects bundle signatures from every signatory within a deadline.
pub struct SignatoryCollector {
	aggregator: QuorumAggregator<dyn SignerInterface>,
	timeout: Duration,
	validator: Option<Arc<BundleValidator>>,
}

impl SignatoryCollector {
	/// Requires `1 <= quorum <= signers.len()` and a non-zero timeout.
	pub fn new(
		signers: Vec<Arc<dyn SignerInterface>>,
		quorum: usize,
		timeout: Duration,
	) -> Result<Self, SignerError> {
		if timeout.is_zero() {
			return Err(SignerError::InvalidConfiguration(
				"Signature timeout must be greater than zero".into(),
			));
		}
		Ok(Self {
			aggregator: QuorumAggregator::new(signers, quorum)?,
			timeout,
			validator: None,
		})
	}

	/// Checks every bundle against the source chain before it is signed.
	pub fn with_validator(mut self, validator: Arc<BundleValidator>) -> Self {
		self.validator = Some(validator);
		self
	}

	pub fn quorum(&self) -> usize {
		self.aggregator.quorum()
	}

	/// Rebuilds the bundle from the source chain. Always passes without a
	/// validator.
	pub async fn check_source(&self, bundle: &StatefulBundle) -> Result<Verdict, ChainError> {
		match &self.validator {
			Some(validator) => validator.check(bundle.bundle()).await,
			None => Ok(Ok(())),
		}
	}

	/// Asks every signatory to sign the bundle hash.
	///
	/// Returns all signatures received before the deadline, at least
	/// `quorum` of them.
	pub async fn signatures_for_bundle(
		&self,
		bundle: &StatefulBundle,
	) -> Result<Vec<BundleSignature>, SignerError> {
		let digest = *bundle.bundle_hash();
		let signatures = self
			.aggregator
			.collect_all(self.timeout, |signer| async move { signer.sign_digest(&digest).await })
			.await?;
		tracing::debug!(
			bundle_id = bundle.id(),
			signatures = signatures.len(),
			"Collected bundle signatures"
		);
		Ok(signatures)
	}
}

/// True when no signatory appears twice.
pub fn distinct_signers(signatures: &[BundleSignature]) -> bool {
	let mut seen = HashSet::with_capacity(signatures.len());
	signatures.iter().all(|s| seen.insert(s.signer))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::local::LocalSigner;
	use relay_types::{Bundle, Bytes, Transfer};

	/// A signatory that never answers.
	struct Silent;

	#[async_trait]
	impl SignerInterface for Silent {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(implementations::local::LocalSignerSchema)
		}

		fn address(&self) -> Address {
			Address::ZERO
		}

		async fn sign_digest(&self, _digest: &B256) -> Result<BundleSignature, SignerError> {
			std::future::pending().await
		}
	}

	fn key(last: u8) -> String {
		format!("0x{}{:02x}", "00".repeat(31), last)
	}

	fn sample_bundle() -> StatefulBundle {
		let bundle = Bundle::new(
			5,
			B256::repeat_byte(5),
			0,
			vec![Transfer::new(B256::repeat_byte(1), Address::repeat_byte(2), 3)],
		);
		StatefulBundle::new(1, bundle)
	}

	#[tokio::test(start_paused = true)]
	async fn test_collects_signatures_from_quorum() {
		let a: Arc<dyn SignerInterface> = Arc::new(LocalSigner::new(&key(1)).unwrap());
		let b: Arc<dyn SignerInterface> = Arc::new(LocalSigner::new(&key(2)).unwrap());
		let silent: Arc<dyn SignerInterface> = Arc::new(Silent);

		let collector =
			SignatoryCollector::new(vec![a.clone(), b.clone(), silent], 2, Duration::from_secs(1)).unwrap();
		let signatures = collector.signatures_for_bundle(&sample_bundle()).await.unwrap();

		assert_eq!(signatures.len(), 2);
		assert!(distinct_signers(&signatures));
		let signers: HashSet<_> = signatures.iter().map(|s| s.signer).collect();
		assert!(signers.contains(&a.address()) && signers.contains(&b.address()));
	}

	#[tokio::test(start_paused = true)]
	async fn test_quorum_not_reached() {
		let a: Arc<dyn SignerInterface> = Arc::new(LocalSigner::new(&key(1)).unwrap());
		let collector =
			SignatoryCollector::new(vec![a, Arc::new(Silent)], 2, Duration::from_millis(100)).unwrap();
		assert!(matches!(
			collector.signatures_for_bundle(&sample_bundle()).await,
			Err(SignerError::QuorumNotAvailable(_))
		));
	}

	#[tokio::test]
	async fn test_check_source_uses_validator() {
		struct NoBundles;
		impl BundleSource for NoBundles {
			fn bundles_in_block(
				&self,
				_block: &relay_types::Block,
				_receipts: &[relay_types::Receipt],
			) -> Result<Vec<Bundle>, String> {
				Ok(Vec::new())
			}
		}

		let a: Arc<dyn SignerInterface> = Arc::new(LocalSigner::new(&key(1)).unwrap());
		let unchecked = SignatoryCollector::new(vec![a.clone()], 1, Duration::from_secs(1)).unwrap();
		assert_eq!(unchecked.check_source(&sample_bundle()).await.unwrap(), Ok(()));

		let connection = Arc::new(relay_chain::testing::MockConnection::new("source"));
		let checked = SignatoryCollector::new(vec![a], 1, Duration::from_secs(1))
			.unwrap()
			.with_validator(Arc::new(BundleValidator::new(connection, Arc::new(NoBundles))));
		assert_eq!(
			checked.check_source(&sample_bundle()).await.unwrap(),
			Err(BundleRejection::UnknownBlock(5))
		);
	}

	#[test]
	fn test_zero_timeout_rejected() {
		let a: Arc<dyn SignerInterface> = Arc::new(Silent);
		assert!(SignatoryCollector::new(vec![a], 1, Duration::ZERO).is_err());
	}

	#[test]
	fn test_distinct_signers() {
		let sig = |b: u8| BundleSignature {
			signer: Address::repeat_byte(b),
			signature: Bytes::new(),
		};
		assert!(distinct_signers(&[sig(1), sig(2)]));
		assert!(!distinct_signers(&[sig(1), sig(2), sig(1)]));
		assert!(distinct_signers(&[]));
	}
}
