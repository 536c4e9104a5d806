//! Source chain watcher.
//!
//! Walks the source chain `tip_distance` blocks behind its tip, turns deposit
//! events into bundles and feeds them to the sign stage. Bundles, their
//! transfer index, the next bundle id and the checkpoint are persisted before
//! anything is forwarded, so a restart resumes from the checkpoint and recovery replays the rest.

use crate::policy::{BundlingPolicy, PolicyError};
use crate::CriticalError;
use relay_chain::processor::filter_block;
use relay_chain::{ChainConnection, ChainError};
use relay_config::BundlingConfig;
use relay_storage::StorageService;
use relay_types::{Block, Bundle, ChainLink, StatefulBundle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Consecutive failed rounds tolerated before the watcher gives up.
pub const MAX_CONSECUTIVE_ERR: usize = 10;

/// Pause after a failed round.
pub const ERROR_DELAY: Duration = Duration::from_millis(100);

const WORKER: &str = "source";

/// Failure of one round.
#[derive(Debug)]
enum RoundError {
	/// The chain did not answer consistently; the round is repeated.
	Recoverable(ChainError),
	Critical(CriticalError),
}

impl From<ChainError> for RoundError {
	fn from(e: ChainError) -> Self {
		RoundError::Recoverable(e)
	}
}

impl From<CriticalError> for RoundError {
	fn from(e: CriticalError) -> Self {
		RoundError::Critical(e)
	}
}

/// Outcome of a successful round.
#[derive(Debug, PartialEq, Eq)]
enum Progress {
	/// Nothing new below the tip distance.
	Idle,
	/// Processed blocks up to and including `last`.
	Advanced { last: u64, bundles: usize },
}

pub struct SourceWatcher {
	connection: Arc<dyn ChainConnection>,
	tip: watch::Receiver<Option<u64>>,
	storage: Arc<StorageService>,
	policy: BundlingPolicy,
	output: mpsc::Sender<StatefulBundle>,
	start_block: u64,
	tip_distance: u64,
	block_batch_size: u64,
	receipt_batch_size: usize,
	poll_interval: Duration,
	checkpoint: Option<ChainLink>,
}

impl SourceWatcher {
	pub fn new(
		connection: Arc<dyn ChainConnection>,
		tip: watch::Receiver<Option<u64>>,
		storage: Arc<StorageService>,
		policy: BundlingPolicy,
		settings: &BundlingConfig,
		output: mpsc::Sender<StatefulBundle>,
	) -> Self {
		Self {
			connection,
			tip,
			storage,
			policy,
			output,
			start_block: settings.start_block,
			tip_distance: settings.tip_distance,
			block_batch_size: settings.block_batch_size.max(1),
			receipt_batch_size: settings.receipt_batch_size.max(1),
			poll_interval: Duration::from_millis(settings.poll_interval_ms),
			checkpoint: None,
		}
	}

	pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CriticalError> {
		self.checkpoint = self
			.storage
			.source_checkpoint()
			.await
			.map_err(|e| CriticalError::new(WORKER, format!("Failed to load checkpoint: {}", e)))?;
		tracing::info!(
			worker = WORKER,
			checkpoint = ?self.checkpoint.map(|c| c.number),
			start_block = self.start_block,
			"Started"
		);

		let mut consecutive_errors = 0usize;
		loop {
			if cancel.is_cancelled() {
				break;
			}
			let round = tokio::select! {
				_ = cancel.cancelled() => break,
				round = self.round(&cancel) => round,
			};

			match round {
				Ok(Progress::Idle) => {
					consecutive_errors = 0;
					if !self.pause(&cancel).await {
						break;
					}
				},
				Ok(Progress::Advanced { last, bundles }) => {
					consecutive_errors = 0;
					tracing::debug!(last_block = last, bundles, "Processed source blocks");
				},
				Err(RoundError::Recoverable(e)) => {
					consecutive_errors += 1;
					tracing::warn!(error = %e, consecutive_errors, "Source round failed");
					if e.is_transient() {
						self.connection.evict_connections();
					}
					if consecutive_errors >= MAX_CONSECUTIVE_ERR {
						return Err(CriticalError::new(
							WORKER,
							format!("{} consecutive failed rounds, last: {}", consecutive_errors, e),
						));
					}
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(ERROR_DELAY) => {},
					}
				},
				Err(RoundError::Critical(e)) => return Err(e),
			}
		}
		tracing::debug!(worker = WORKER, "Stopped");
		Ok(())
	}

	/// First block not yet processed.
	fn next_block(&self) -> u64 {
		self.checkpoint
			.map(|c| c.number + 1)
			.unwrap_or(self.start_block)
	}

	async fn round(&mut self, cancel: &CancellationToken) -> Result<Progress, RoundError> {
		let tip = *self.tip.borrow();
		let Some(tip) = tip else {
			return Ok(Progress::Idle);
		};
		let chain_head = tip.saturating_sub(self.tip_distance);
		let start = self.next_block();
		if start > chain_head {
			return Ok(Progress::Idle);
		}
		let end = chain_head.min(start.saturating_add(self.block_batch_size - 1));

		let blocks = self.connection.get_blocks_range_closed(start, end).await?;
		self.verify_linkage(start, end, &blocks)?;

		let mut bundles = Vec::new();
		let candidates: Vec<&Block> = blocks
			.iter()
			.filter(|block| filter_block(block, self.policy.filter()))
			.collect();
		for batch in receipt_batches(&candidates, self.receipt_batch_size) {
			let fetched = self.connection.get_receipts_for_blocks(&batch).await?;
			for item in fetched {
				match self.policy.from_unfiltered_block(&item.block, &item.receipts) {
					Ok(found) => bundles.extend(found),
					Err(PolicyError::Chain(e)) => return Err(e.into()),
					Err(e) => {
						return Err(CriticalError::new(
							WORKER,
							format!("Cannot bundle block {} ({}): {}", item.block.number, item.block.hash, e),
						)
						.into())
					},
				}
			}
		}

		let Some(last) = blocks.last().map(Block::link) else {
			return Ok(Progress::Idle);
		};
		let stored = self.persist(bundles, last).await?;
		let count = stored.len();
		self.checkpoint = Some(last);

		for bundle in stored {
			let sent = tokio::select! {
				_ = cancel.cancelled() => return Ok(Progress::Advanced { last: last.number, bundles: count }),
				sent = self.output.send(bundle) => sent,
			};
			if sent.is_err() {
				return Err(CriticalError::new(WORKER, "Sign queue closed").into());
			}
		}
		Ok(Progress::Advanced {
			last: last.number,
			bundles: count,
		})
	}

	/// The range must be complete, in order, and chained to the checkpoint.
	fn verify_linkage(&self, start: u64, end: u64, blocks: &[Block]) -> Result<(), CriticalError> {
		let expected = (end - start + 1) as usize;
		if blocks.len() != expected {
			return Err(CriticalError::new(
				WORKER,
				format!("Requested {} blocks from {}, received {}", expected, start, blocks.len()),
			));
		}

		let mut previous = self.checkpoint;
		for (offset, block) in blocks.iter().enumerate() {
			if block.number != start + offset as u64 {
				return Err(CriticalError::new(
					WORKER,
					format!("Expected block {}, received {}", start + offset as u64, block.number),
				));
			}
			if let Some(parent) = previous {
				if block.parent_hash != parent.hash {
					return Err(CriticalError::new(
						WORKER,
						format!(
							"Block {} ({}) does not extend {} ({}), source reorganized past the tip distance",
							block.number, block.hash, parent.number, parent.hash
						),
					));
				}
			}
			previous = Some(block.link());
		}
		Ok(())
	}

	/// Assigns ids and persists the bundles, the next id and the checkpoint.
	async fn persist(
		&self,
		bundles: Vec<Bundle>,
		last: ChainLink,
	) -> Result<Vec<StatefulBundle>, CriticalError> {
		let storage_error = |what: &str, e: relay_storage::StorageError| {
			CriticalError::new(WORKER, format!("Failed to persist {}: {}", what, e))
		};

		let mut next_id = self
			.storage
			.next_bundle_id()
			.await
			.map_err(|e| storage_error("bundle id", e))?;
		let mut stored = Vec::with_capacity(bundles.len());
		for bundle in bundles {
			let mut bundle = StatefulBundle::new(next_id, bundle);
			bundle
				.set_stored()
				.map_err(|e| CriticalError::bundle(WORKER, &bundle, e.to_string()))?;
			self.storage
				.store_bundle(&bundle)
				.await
				.map_err(|e| storage_error("bundle", e))?;
			self.storage
				.index_transfers(&bundle)
				.await
				.map_err(|e| storage_error("transfer index", e))?;
			tracing::info!(
				bundle_id = next_id,
				source_block = bundle.bundle().source_block_number(),
				transfers = bundle.transfers().len(),
				"Stored bundle"
			);
			stored.push(bundle);
			next_id += 1;
		}

		self.storage
			.set_next_bundle_id(next_id)
			.await
			.map_err(|e| storage_error("bundle id", e))?;
		self.storage
			.set_source_checkpoint(&last)
			.await
			.map_err(|e| storage_error("checkpoint", e))?;
		Ok(stored)
	}

	/// Sleeps until the tip changes or the poll interval passes. False on
	/// cancellation.
	async fn pause(&mut self, cancel: &CancellationToken) -> bool {
		let tip = &mut self.tip;
		let tip_changed = async move {
			if tip.changed().await.is_err() {
				std::future::pending::<()>().await
			}
		};
		tokio::select! {
			_ = cancel.cancelled() => false,
			_ = tip_changed => true,
			_ = tokio::time::sleep(self.poll_interval) => true,
		}
	}
}

/// Splits blocks into batches of at most `max_receipts` transactions. A block
/// with more transactions than that gets a batch of its own.
fn receipt_batches(blocks: &[&Block], max_receipts: usize) -> Vec<Vec<Block>> {
	let mut batches = Vec::new();
	let mut current: Vec<Block> = Vec::new();
	let mut receipts = 0usize;
	for block in blocks {
		let count = block.transaction_hashes.len();
		if !current.is_empty() && receipts + count > max_receipts {
			batches.push(std::mem::take(&mut current));
			receipts = 0;
		}
		receipts += count;
		current.push((*block).clone());
	}
	if !current.is_empty() {
		batches.push(current);
	}
	batches
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_chain::testing::{block, block_hash, linked_blocks, receipt, MockConnection};
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{Address, Bytes, ChainHasher, EventFilter, Log, B256};

	const DEPOSIT: &str = "Deposit(bytes32,uint256)";

	fn contract() -> Address {
		Address::repeat_byte(0xaa)
	}

	fn filter() -> EventFilter {
		EventFilter::new(ChainHasher::Keccak256, contract(), DEPOSIT)
	}

	fn settings(start_block: u64, tip_distance: u64) -> BundlingConfig {
		BundlingConfig {
			deposit_event: DEPOSIT.into(),
			start_block,
			tip_distance,
			block_batch_size: 4,
			receipt_batch_size: 2,
			transfers_per_bundle: 2,
			amount_scale_exponent: 0,
			poll_interval_ms: 10,
		}
	}

	fn deposit(recipient: u8, amount: u128) -> Log {
		let mut data = vec![0u8; 16];
		data.extend_from_slice(&amount.to_be_bytes());
		Log {
			address: contract(),
			data: Bytes::from(data),
			topics: vec![
				ChainHasher::Keccak256.event_signature(DEPOSIT),
				B256::repeat_byte(0x01),
				Address::repeat_byte(recipient).into_word(),
			],
		}
	}

	/// Source chain `0..=head` with `deposits` deposit transactions in block 2.
	fn source_chain(head: u64, deposits: u8) -> Arc<MockConnection> {
		let conn = Arc::new(MockConnection::new("source"));
		for mut b in linked_blocks(0, head) {
			if b.number == 2 {
				let txs: Vec<B256> = (1..=deposits).map(B256::repeat_byte).collect();
				for (i, tx) in txs.iter().enumerate() {
					conn.insert_receipt(receipt(&b, *tx, i as u32, vec![deposit(0x10 + i as u8, 5)]));
				}
				b.transaction_hashes = txs;
				b.logs_bloom = *filter().bloom();
			}
			conn.push_block(b);
		}
		conn
	}

	struct Fixture {
		watcher: SourceWatcher,
		storage: Arc<StorageService>,
		output: mpsc::Receiver<StatefulBundle>,
		_tip: watch::Sender<Option<u64>>,
	}

	fn fixture(conn: Arc<MockConnection>, tip: Option<u64>, tip_distance: u64) -> Fixture {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let (tip_tx, tip_rx) = watch::channel(tip);
		let (out_tx, out_rx) = mpsc::channel(8);
		let watcher = SourceWatcher::new(
			conn,
			tip_rx,
			storage.clone(),
			BundlingPolicy::new(filter(), 2, 0).unwrap(),
			&settings(0, tip_distance),
			out_tx,
		);
		Fixture {
			watcher,
			storage,
			output: out_rx,
			_tip: tip_tx,
		}
	}

	#[test]
	fn test_receipt_batches_respect_limit() {
		let a = block(1, B256::ZERO, vec![B256::repeat_byte(1)]);
		let b = block(2, B256::ZERO, vec![B256::repeat_byte(2), B256::repeat_byte(3), B256::repeat_byte(4)]);
		let c = block(3, B256::ZERO, vec![B256::repeat_byte(5)]);
		let d = block(4, B256::ZERO, vec![B256::repeat_byte(6)]);
		let batches = receipt_batches(&[&a, &b, &c, &d], 2);
		let numbers: Vec<Vec<u64>> = batches
			.iter()
			.map(|batch| batch.iter().map(|b| b.number).collect())
			.collect();
		assert_eq!(numbers, vec![vec![1], vec![2], vec![3, 4]]);
	}

	#[tokio::test]
	async fn test_round_bundles_persists_and_forwards() {
		let mut f = fixture(source_chain(5, 3), Some(5), 0);
		let cancel = CancellationToken::new();

		let progress = f.watcher.round(&cancel).await.unwrap();
		assert_eq!(progress, Progress::Advanced { last: 3, bundles: 2 });

		let first = f.output.recv().await.unwrap();
		let second = f.output.recv().await.unwrap();
		assert_eq!((first.id(), second.id()), (1, 2));
		assert_eq!(first.transfers().len(), 2);
		assert_eq!(second.transfers().len(), 1);
		assert_eq!(f.storage.next_bundle_id().await.unwrap(), 3);
		assert_eq!(
			f.storage.source_checkpoint().await.unwrap(),
			Some(ChainLink {
				number: 3,
				hash: block_hash(3)
			})
		);
		assert!(f.storage.load_bundle(2).await.unwrap().is_some());
		assert_eq!(
			f.storage.bundle_for_transfer(&B256::repeat_byte(2)).await.unwrap(),
			Some(1)
		);
		assert_eq!(
			f.storage.bundle_for_transfer(&B256::repeat_byte(3)).await.unwrap(),
			Some(2)
		);

		let progress = f.watcher.round(&cancel).await.unwrap();
		assert_eq!(progress, Progress::Advanced { last: 5, bundles: 0 });
		let progress = f.watcher.round(&cancel).await.unwrap();
		assert_eq!(progress, Progress::Idle);
	}

	#[tokio::test]
	async fn test_stays_behind_tip_distance() {
		let mut f = fixture(source_chain(5, 1), Some(5), 3);
		let cancel = CancellationToken::new();
		assert_eq!(
			f.watcher.round(&cancel).await.unwrap(),
			Progress::Advanced { last: 2, bundles: 1 }
		);
		assert_eq!(f.watcher.round(&cancel).await.unwrap(), Progress::Idle);
	}

	#[tokio::test]
	async fn test_unknown_tip_is_idle() {
		let mut f = fixture(source_chain(5, 1), None, 0);
		assert_eq!(
			f.watcher.round(&CancellationToken::new()).await.unwrap(),
			Progress::Idle
		);
	}

	#[tokio::test]
	async fn test_resumes_after_checkpoint() {
		let mut f = fixture(source_chain(5, 1), Some(5), 0);
		f.storage
			.set_source_checkpoint(&ChainLink {
				number: 2,
				hash: block_hash(2),
			})
			.await
			.unwrap();
		f.watcher.checkpoint = f.storage.source_checkpoint().await.unwrap();

		assert_eq!(
			f.watcher.round(&CancellationToken::new()).await.unwrap(),
			Progress::Advanced { last: 5, bundles: 0 }
		);
	}

	#[tokio::test]
	async fn test_linkage_break_is_critical() {
		let conn = source_chain(5, 0);
		let mut f = fixture(conn, Some(5), 0);
		f.watcher.checkpoint = Some(ChainLink {
			number: 1,
			hash: B256::repeat_byte(0xee),
		});
		assert!(matches!(
			f.watcher.round(&CancellationToken::new()).await,
			Err(RoundError::Critical(_))
		));
	}

	#[tokio::test]
	async fn test_missing_receipt_is_recoverable() {
		let conn = source_chain(3, 2);
		conn.remove_receipt(&B256::repeat_byte(2));
		let mut f = fixture(conn, Some(3), 0);
		assert!(matches!(
			f.watcher.round(&CancellationToken::new()).await,
			Err(RoundError::Recoverable(ChainError::MissingReceipts(_)))
		));
		assert_eq!(f.storage.next_bundle_id().await.unwrap(), 1);
		assert_eq!(f.storage.source_checkpoint().await.unwrap(), None);
	}

	#[tokio::test(start_paused = true)]
	async fn test_repeated_failures_are_critical() {
		let conn = source_chain(3, 1);
		conn.set_failing(true);
		let f = fixture(conn.clone(), Some(3), 0);
		let err = f.watcher.run(CancellationToken::new()).await.unwrap_err();
		assert_eq!(err.worker, WORKER);
		assert_eq!(conn.eviction_count(), MAX_CONSECUTIVE_ERR);
	}

	#[tokio::test(start_paused = true)]
	async fn test_run_stops_on_cancel() {
		let f = fixture(source_chain(3, 1), Some(3), 0);
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(f.watcher.run(cancel.clone()));
		tokio::time::sleep(Duration::from_secs(1)).await;
		cancel.cancel();
		assert!(handle.await.unwrap().is_ok());
	}
}
