//! In-process signatory holding a raw private key.

use crate::{SignerError, SignerFactory, SignerInterface, SignerRegistry};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use relay_types::{
	Address, BundleSignature, Bytes, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema,
	SecretString, ValidationError, B256,
};

/// Signs digests with a secp256k1 key loaded from configuration.
pub struct LocalSigner {
	signer: PrivateKeySigner,
}

impl LocalSigner {
	pub fn new(private_key: &str) -> Result<Self, SignerError> {
		let signer = private_key
			.parse::<PrivateKeySigner>()
			.map_err(|e| SignerError::InvalidKey(format!("Invalid private key: {}", e)))?;
		Ok(Self { signer })
	}
}

/// Configuration schema for the local signer.
pub struct LocalSignerSchema;

impl ConfigSchema for LocalSignerSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("private_key", FieldType::Hex { bytes: 32 })],
			vec![],
		)
		.validate(config)
	}
}

#[async_trait]
impl SignerInterface for LocalSigner {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalSignerSchema)
	}

	fn address(&self) -> Address {
		self.signer.address()
	}

	async fn sign_digest(&self, digest: &B256) -> Result<BundleSignature, SignerError> {
		let signature = self
			.signer
			.sign_hash(digest)
			.await
			.map_err(|e| SignerError::SigningFailed(e.to_string()))?;
		Ok(BundleSignature {
			signer: self.signer.address(),
			signature: Bytes::copy_from_slice(&signature.as_bytes()),
		})
	}
}

/// Factory function to create a local signer from configuration.
///
/// Configuration parameters:
/// - `private_key`: 32-byte hex key, with or without `0x`
pub fn create_signer(config: &toml::Value) -> Result<Box<dyn SignerInterface>, SignerError> {
	LocalSignerSchema
		.validate(config)
		.map_err(|e| SignerError::InvalidConfiguration(e.to_string()))?;

	let key = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.map(SecretString::from)
		.ok_or_else(|| SignerError::InvalidConfiguration("private_key is required".into()))?;

	let signer = key.with_exposed(LocalSigner::new)?;
	Ok(Box::new(signer))
}

/// Registry for the local signer implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "local";
	type Factory = SignerFactory;

	fn factory() -> Self::Factory {
		create_signer
	}
}

impl SignerRegistry for Registry {}
