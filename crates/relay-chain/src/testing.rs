//! Scripted in-memory chain connection for tests.

use crate::{ChainConnection, ChainError};
use async_trait::async_trait;
use relay_types::{Address, Block, BlockTag, Bloom, Bytes, ChainHasher, Log, Receipt, B256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
	block_number: Option<u64>,
	blocks: HashMap<u64, Block>,
	receipts: HashMap<B256, Receipt>,
	call_results: HashMap<Bytes, Bytes>,
	balance: U256,
	nonce: u64,
	gas_price: u128,
	sent: Vec<Bytes>,
	reported_tx_hash: Option<B256>,
	failing: bool,
	delay: Duration,
}

/// A node whose answers are set by the test.
///
/// Contract calls are answered by exact call data; unknown call data returns
/// 32 zero bytes. Raw transactions are recorded and hashed with Keccak-256.
pub struct MockConnection {
	name: String,
	state: Mutex<State>,
	calls: AtomicUsize,
	evictions: AtomicUsize,
}

impl MockConnection {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			state: Mutex::new(State {
				gas_price: 1,
				..State::default()
			}),
			calls: AtomicUsize::new(0),
			evictions: AtomicUsize::new(0),
		}
	}

	fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		f(&mut state)
	}

	pub fn set_block_number(&self, number: u64) {
		self.with_state(|s| s.block_number = Some(number));
	}

	/// Adds a block and moves the reported height up to it.
	pub fn push_block(&self, block: Block) {
		self.with_state(|s| {
			s.block_number = Some(s.block_number.unwrap_or(0).max(block.number));
			s.blocks.insert(block.number, block);
		});
	}

	pub fn insert_receipt(&self, receipt: Receipt) {
		self.with_state(|s| {
			s.receipts.insert(receipt.transaction_hash, receipt);
		});
	}

	pub fn remove_receipt(&self, tx_hash: &B256) {
		self.with_state(|s| {
			s.receipts.remove(tx_hash);
		});
	}

	pub fn set_call_result(&self, data: Bytes, result: Bytes) {
		self.with_state(|s| {
			s.call_results.insert(data, result);
		});
	}

	pub fn set_nonce(&self, nonce: u64) {
		self.with_state(|s| s.nonce = nonce);
	}

	pub fn set_balance(&self, balance: U256) {
		self.with_state(|s| s.balance = balance);
	}

	/// While failing, every call returns [`ChainError::IncompleteApiCall`].
	pub fn set_failing(&self, failing: bool) {
		self.with_state(|s| s.failing = failing);
	}

	/// Delays every answer by `delay`.
	pub fn set_delay(&self, delay: Duration) {
		self.with_state(|s| s.delay = delay);
	}

	/// Answers every broadcast with `hash` instead of the real one.
	pub fn set_reported_tx_hash(&self, hash: B256) {
		self.with_state(|s| s.reported_tx_hash = Some(hash));
	}

	pub fn sent_transactions(&self) -> Vec<Bytes> {
		self.with_state(|s| s.sent.clone())
	}

	pub fn call_count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn eviction_count(&self) -> usize {
		self.evictions.load(Ordering::SeqCst)
	}

	async fn answer<R>(&self, f: impl FnOnce(&mut State) -> Result<R, ChainError>) -> Result<R, ChainError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let delay = self.with_state(|s| s.delay);
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		self.with_state(|s| {
			if s.failing {
				return Err(ChainError::IncompleteApiCall("mock connection failing".into()));
			}
			f(s)
		})
	}
}

#[async_trait]
impl ChainConnection for MockConnection {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_block_number(&self) -> Result<u64, ChainError> {
		self.answer(|s| {
			s.block_number
				.ok_or_else(|| ChainError::IncompleteApiCall("no blocks".into()))
		})
		.await
	}

	async fn get_block(&self, number: u64) -> Result<Option<Block>, ChainError> {
		self.answer(|s| Ok(s.blocks.get(&number).cloned())).await
	}

	async fn get_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError> {
		self.answer(|s| Ok(s.receipts.get(&tx_hash).cloned())).await
	}

	async fn contract_call(&self, _to: Address, data: Bytes, _tag: BlockTag) -> Result<Bytes, ChainError> {
		self.answer(|s| {
			Ok(s.call_results
				.get(&data)
				.cloned()
				.unwrap_or_else(|| Bytes::from(vec![0u8; 32])))
		})
		.await
	}

	async fn get_balance(&self, _address: Address, _tag: BlockTag) -> Result<U256, ChainError> {
		self.answer(|s| Ok(s.balance)).await
	}

	async fn get_nonce(&self, _address: Address) -> Result<u64, ChainError> {
		self.answer(|s| Ok(s.nonce)).await
	}

	async fn get_gas_price(&self) -> Result<u128, ChainError> {
		self.answer(|s| Ok(s.gas_price)).await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
		self.answer(|s| {
			let hash = ChainHasher::Keccak256.hash(&raw);
			s.sent.push(raw);
			Ok(s.reported_tx_hash.unwrap_or(hash))
		})
		.await
	}

	async fn peer_count(&self) -> Result<u64, ChainError> {
		self.answer(|_| Ok(1)).await
	}

	fn evict_connections(&self) {
		self.evictions.fetch_add(1, Ordering::SeqCst);
	}
}

/// Builds a block whose hash is derived from its number.
pub fn block(number: u64, parent_hash: B256, transaction_hashes: Vec<B256>) -> Block {
	Block {
		number,
		hash: block_hash(number),
		parent_hash,
		logs_bloom: Bloom::ZERO,
		total_difficulty: U256::from(number),
		timestamp: 1_600_000_000 + number,
		transaction_hashes,
	}
}

/// The hash [`block`] assigns to `number`.
pub fn block_hash(number: u64) -> B256 {
	ChainHasher::Keccak256.hash(&number.to_be_bytes())
}

/// Builds a chain of linked blocks `start..=end` without transactions.
pub fn linked_blocks(start: u64, end: u64) -> Vec<Block> {
	(start..=end)
		.map(|n| block(n, if n == 0 { B256::ZERO } else { block_hash(n - 1) }, vec![]))
		.collect()
}

/// Builds a successful receipt in `block` with the bloom of its logs.
pub fn receipt(block: &Block, tx_hash: B256, index: u32, logs: Vec<Log>) -> Receipt {
	receipt_with_hasher(ChainHasher::Keccak256, block, tx_hash, index, logs)
}

/// Like [`receipt`], computing the bloom with `hasher`.
pub fn receipt_with_hasher(
	hasher: ChainHasher,
	block: &Block,
	tx_hash: B256,
	index: u32,
	logs: Vec<Log>,
) -> Receipt {
	let mut bloom = Bloom::ZERO;
	for log in &logs {
		bloom.accrue(hasher, log.address.as_slice());
		for topic in &log.topics {
			bloom.accrue(hasher, topic.as_slice());
		}
	}
	Receipt {
		block_number: block.number,
		transaction_hash: tx_hash,
		block_hash: block.hash,
		from: Address::repeat_byte(0xf0),
		to: None,
		logs_bloom: bloom,
		logs,
		status: true,
		transaction_index: index,
	}
}
