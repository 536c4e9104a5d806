//! JSON-RPC chain connection built on Alloy.
//!
//! The provider sits behind an [`ArcSwap`]. Evicting connections swaps in a
//! provider with a fresh HTTP client, while requests already running keep
//! the old one until they finish.

use crate::{validate_endpoint, ChainConnection, ChainError, ConnectionFactory};
use alloy_eips::{BlockId, BlockNumberOrTag};
use alloy_primitives::U64;
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::{BlockTransactionsKind, TransactionInput, TransactionReceipt, TransactionRequest};
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use relay_types::{
	Address, Block, BlockTag, Bloom, Bytes, ConfigSchema, Field, FieldType, ImplementationRegistry,
	Log, Receipt, Schema, ValidationError, B256, U256,
};
use std::sync::Arc;

type DynProvider = Arc<dyn Provider<Http<reqwest::Client>> + Send + Sync>;

/// Single-node connection over HTTP JSON-RPC.
pub struct AlloyConnection {
	url: reqwest::Url,
	provider: ArcSwap<DynProvider>,
}

impl AlloyConnection {
	pub fn new(rpc_url: &str) -> Result<Self, ChainError> {
		let url: reqwest::Url = rpc_url
			.parse()
			.map_err(|e| ChainError::InvalidConfiguration(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;
		Ok(Self {
			provider: ArcSwap::from_pointee(build_provider(&url)),
			url,
		})
	}

	fn provider(&self) -> DynProvider {
		(**self.provider.load()).clone()
	}
}

fn build_provider(url: &reqwest::Url) -> DynProvider {
	Arc::new(ProviderBuilder::new().on_http(url.clone()))
}

fn block_id(tag: BlockTag) -> BlockId {
	match tag {
		BlockTag::Latest => BlockId::Number(BlockNumberOrTag::Latest),
		BlockTag::Number(n) => BlockId::Number(BlockNumberOrTag::Number(n)),
	}
}

/// Deserialization failures mean the node said something unexpected; any
/// other failure means it said nothing usable.
fn rpc_error(call: &str, err: TransportError) -> ChainError {
	if err.is_deser_error() {
		ChainError::MalformedApiResponse(format!("{}: {}", call, err))
	} else {
		ChainError::IncompleteApiCall(format!("{}: {}", call, err))
	}
}

fn convert_block(block: alloy_rpc_types::Block) -> Block {
	let header = &block.header;
	Block {
		number: header.number,
		hash: header.hash,
		parent_hash: header.parent_hash,
		logs_bloom: Bloom::from(header.logs_bloom),
		total_difficulty: header.total_difficulty.unwrap_or(U256::ZERO),
		timestamp: header.timestamp,
		transaction_hashes: block.transactions.hashes().collect(),
	}
}

fn convert_receipt(receipt: TransactionReceipt) -> Result<Receipt, ChainError> {
	let pending = |field: &str| {
		ChainError::MalformedApiResponse(format!(
			"Receipt {} has no {}",
			receipt.transaction_hash, field
		))
	};
	let block_number = receipt.block_number.ok_or_else(|| pending("block number"))?;
	let block_hash = receipt.block_hash.ok_or_else(|| pending("block hash"))?;
	let transaction_index = receipt
		.transaction_index
		.ok_or_else(|| pending("transaction index"))?;
	let transaction_index = u32::try_from(transaction_index).map_err(|_| {
		ChainError::MalformedApiResponse(format!("Transaction index {} out of range", transaction_index))
	})?;

	let logs = receipt
		.inner
		.logs()
		.iter()
		.map(|log| Log {
			address: log.address(),
			data: log.data().data.clone(),
			topics: log.topics().to_vec(),
		})
		.collect();

	Ok(Receipt {
		block_number,
		transaction_hash: receipt.transaction_hash,
		block_hash,
		from: receipt.from,
		to: receipt.to,
		logs_bloom: Bloom::from(*receipt.inner.logs_bloom()),
		logs,
		status: receipt.status(),
		transaction_index,
	})
}

#[async_trait]
impl ChainConnection for AlloyConnection {
	fn name(&self) -> &str {
		self.url.as_str()
	}

	async fn get_block_number(&self) -> Result<u64, ChainError> {
		self.provider()
			.get_block_number()
			.await
			.map_err(|e| rpc_error("eth_blockNumber", e))
	}

	async fn get_block(&self, number: u64) -> Result<Option<Block>, ChainError> {
		let block = self
			.provider()
			.get_block_by_number(BlockNumberOrTag::Number(number), BlockTransactionsKind::Hashes)
			.await
			.map_err(|e| rpc_error("eth_getBlockByNumber", e))?;
		Ok(block.map(convert_block))
	}

	async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError> {
		let receipt = self
			.provider()
			.get_transaction_receipt(tx_hash)
			.await
			.map_err(|e| rpc_error("eth_getTransactionReceipt", e))?;
		receipt.map(convert_receipt).transpose()
	}

	async fn contract_call(&self, to: Address, data: Bytes, tag: BlockTag) -> Result<Bytes, ChainError> {
		let request = TransactionRequest::default()
			.to(to)
			.input(TransactionInput::new(data));
		self.provider()
			.call(&request)
			.block(block_id(tag))
			.await
			.map_err(|e| rpc_error("eth_call", e))
	}

	async fn get_balance(&self, address: Address, tag: BlockTag) -> Result<U256, ChainError> {
		self.provider()
			.get_balance(address)
			.block_id(block_id(tag))
			.await
			.map_err(|e| rpc_error("eth_getBalance", e))
	}

	async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
		self.provider()
			.get_transaction_count(address)
			.await
			.map_err(|e| rpc_error("eth_getTransactionCount", e))
	}

	async fn get_gas_price(&self) -> Result<u128, ChainError> {
		self.provider()
			.get_gas_price()
			.await
			.map_err(|e| rpc_error("eth_gasPrice", e))
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
		let pending = self
			.provider()
			.send_raw_transaction(&raw)
			.await
			.map_err(|e| rpc_error("eth_sendRawTransaction", e))?;
		Ok(*pending.tx_hash())
	}

	async fn peer_count(&self) -> Result<u64, ChainError> {
		let provider = self.provider();
		let count: U64 = provider
			.client()
			.request("net_peerCount", ())
			.await
			.map_err(|e| rpc_error("net_peerCount", e))?;
		Ok(count.to::<u64>())
	}

	fn evict_connections(&self) {
		tracing::debug!(endpoint = %self.url, "Evicting pooled connections");
		self.provider.store(Arc::new(build_provider(&self.url)));
	}
}

/// Configuration schema for an Alloy endpoint table.
pub struct AlloyConnectionSchema;

impl ConfigSchema for AlloyConnectionSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("rpc_url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
					_ => Err("rpc_url must be an http(s) URL".to_string()),
				}
			})],
			vec![],
		);
		schema.validate(config)
	}
}

/// Factory function to create an Alloy connection from an endpoint table.
///
/// Configuration parameters:
/// - `rpc_url`: HTTP(S) JSON-RPC endpoint of the node
pub fn create_connection(config: &toml::Value) -> Result<Box<dyn ChainConnection>, ChainError> {
	validate_endpoint(&AlloyConnectionSchema, config)?;
	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ChainError::InvalidConfiguration("rpc_url is required".into()))?;
	Ok(Box::new(AlloyConnection::new(rpc_url)?))
}

/// Registry for the Alloy connection implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "evm_alloy";
	type Factory = ConnectionFactory;

	fn factory() -> Self::Factory {
		create_connection
	}
}
