//! Locally signed legacy transactions built with Alloy.
//!
//! The nonce comes from a local counter seeded from the chain on first use
//! and after any failed broadcast, so back-to-back submissions do not wait
//! for the previous transaction to be mined.

use crate::contract::encode_submit_bundle;
use crate::{DeliveryContext, DeliveryError, DeliveryFactory, DeliveryInterface, DeliveryRegistry};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use relay_types::{
	short_hash, Address, Bytes, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema,
	SecretString, StatefulBundle, SubmittedTx, ValidationError,
};
use tokio::sync::Mutex;

const DEFAULT_GAS_LIMIT: u64 = 2_000_000;

/// Alloy based delivery over a consolidated destination connection.
pub struct AlloyDelivery {
	context: DeliveryContext,
	wallet: EthereumWallet,
	sender: Address,
	gas_limit: u64,
	/// Next nonce to use; `None` forces a reseed from the chain.
	nonce: Mutex<Option<u64>>,
}

impl AlloyDelivery {
	pub fn new(context: DeliveryContext, signer: PrivateKeySigner, gas_limit: u64) -> Self {
		let sender = signer.address();
		Self {
			context,
			wallet: EthereumWallet::from(signer),
			sender,
			gas_limit,
			nonce: Mutex::new(None),
		}
	}
}

/// Configuration schema for Alloy delivery.
pub struct AlloyDeliverySchema;

impl ConfigSchema for AlloyDeliverySchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("private_key", FieldType::Hex { bytes: 32 })],
			vec![Field::new(
				"gas_limit",
				FieldType::Integer {
					min: Some(21_000),
					max: None,
				},
			)],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl DeliveryInterface for AlloyDelivery {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyDeliverySchema)
	}

	fn sender(&self) -> Address {
		self.sender
	}

	async fn submit_bundle(&self, bundle: &StatefulBundle, tip: u64) -> Result<SubmittedTx, DeliveryError> {
		let connection = &self.context.connection;
		let mut next_nonce = self.nonce.lock().await;
		let nonce = match *next_nonce {
			Some(nonce) => nonce,
			None => connection.get_nonce(self.sender).await?,
		};
		let gas_price = connection.get_gas_price().await?;

		let request = TransactionRequest::default()
			.with_from(self.sender)
			.with_to(self.context.bridge_contract)
			.with_input(encode_submit_bundle(bundle))
			.with_nonce(nonce)
			.with_chain_id(self.context.chain_id)
			.with_gas_limit(self.gas_limit)
			.with_gas_price(gas_price);

		let envelope = request
			.build(&self.wallet)
			.await
			.map_err(|e| DeliveryError::TransactionFailed(format!("Failed to sign transaction: {}", e)))?;
		let expected_hash = *envelope.tx_hash();
		let raw = Bytes::from(envelope.encoded_2718());

		let tx_hash = match connection.send_raw_transaction(raw).await {
			Ok(hash) => hash,
			Err(e) => {
				*next_nonce = None;
				return Err(e.into());
			},
		};
		if tx_hash != expected_hash {
			// Whatever the node did with our nonce, the chain knows better.
			*next_nonce = None;
			return Err(DeliveryError::HashMismatch {
				expected: expected_hash,
				reported: tx_hash,
			});
		}
		*next_nonce = Some(nonce + 1);
		tracing::info!(
			bundle_id = bundle.id(),
			bundle_hash = %short_hash(bundle.bundle_hash()),
			tx_hash = %tx_hash,
			nonce,
			"Submitted bundle"
		);

		Ok(SubmittedTx {
			block_number: tip,
			tx_hash,
			from: self.sender,
			nonce,
		})
	}
}

/// Factory function to create an Alloy delivery from configuration.
///
/// Configuration parameters:
/// - `private_key`: relayer key, 32-byte hex
/// - `gas_limit`: gas limit per submission (optional, defaults to 2,000,000)
pub fn create_delivery(
	config: &toml::Value,
	context: DeliveryContext,
) -> Result<Box<dyn DeliveryInterface>, DeliveryError> {
	AlloyDeliverySchema
		.validate(config)
		.map_err(|e| DeliveryError::InvalidConfiguration(e.to_string()))?;

	let key = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.map(SecretString::from)
		.ok_or_else(|| DeliveryError::InvalidConfiguration("private_key is required".into()))?;
	let signer = key
		.with_exposed(|k| k.parse::<PrivateKeySigner>())
		.map_err(|e| DeliveryError::InvalidConfiguration(format!("Invalid private key: {}", e)))?;

	let gas_limit = config
		.get("gas_limit")
		.and_then(|v| v.as_integer())
		.map(|v| v as u64)
		.unwrap_or(DEFAULT_GAS_LIMIT);

	Ok(Box::new(AlloyDelivery::new(context, signer, gas_limit)))
}

/// Registry for the Alloy delivery implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "evm_alloy";
	type Factory = DeliveryFactory;

	fn factory() -> Self::Factory {
		create_delivery
	}
}

impl DeliveryRegistry for Registry {}
