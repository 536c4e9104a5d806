//! Relay engine: wires the pipeline together and supervises it.
//!
//! ```text
//! source tip ─┐
//!             ▼
//!      SourceWatcher ─▶ sign ─▶ broadcast ─▶ collect receipts ─▶ finalize
//!                                  ▲               ▲                 ▲
//! destination tip ─────────────────┴───────────────┴─────────────────┘
//! ```
//!
//! The first worker to fail critically stops the relay. Ctrl-C or
//! [`RelayEngine::shutdown_token`] stop it cleanly.

use crate::balance::BalanceMonitor;
use crate::policy::{BundlingPolicy, UnbundlingPolicy};
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::retry::{receipt_missing, signatures_unusable, RetryBuilder, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_SLEEP};
use crate::tip::TipState;
use crate::workers::{
	BroadcastStage, CollectReceiptsStage, FinalizeStage, Inbox, SignStage, SourceWatcher, StageRunner,
};
use crate::{CriticalError, RelayError};
use relay_chain::{BlockNumberCollector, ChainConnection};
use relay_config::{ChainConfig, Config};
use relay_delivery::DeliveryService;
use relay_signer::SignatoryCollector;
use relay_storage::StorageService;
use relay_types::EventFilter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ENGINE: &str = "engine";

type WorkerSet = JoinSet<(&'static str, Result<(), CriticalError>)>;

/// The assembled relay. Built by [`crate::RelayBuilder`].
pub struct RelayEngine {
	config: Config,
	storage: Arc<StorageService>,
	source: Arc<dyn ChainConnection>,
	destination: Arc<dyn ChainConnection>,
	source_tip: Arc<BlockNumberCollector>,
	destination_tip: Arc<BlockNumberCollector>,
	signatories: Arc<SignatoryCollector>,
	delivery: Arc<DeliveryService>,
	shutdown: CancellationToken,
}

impl RelayEngine {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		config: Config,
		storage: Arc<StorageService>,
		source: Arc<dyn ChainConnection>,
		destination: Arc<dyn ChainConnection>,
		source_tip: Arc<BlockNumberCollector>,
		destination_tip: Arc<BlockNumberCollector>,
		signatories: Arc<SignatoryCollector>,
		delivery: Arc<DeliveryService>,
	) -> Self {
		Self {
			config,
			storage,
			source,
			destination,
			source_tip,
			destination_tip,
			signatories,
			delivery,
			shutdown: CancellationToken::new(),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	/// Cancelling this token stops [`RelayEngine::run`] as Ctrl-C would.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Runs the relay until shutdown or the first critical error.
	pub async fn run(&self) -> Result<(), RelayError> {
		tracing::info!(relay_id = %self.config.relay.id, "Starting relay");
		let report = RecoveryService::new(self.storage.clone()).recover().await?;

		let cancel = self.shutdown.child_token();
		let mut workers = WorkerSet::new();
		self.spawn_pipeline(&mut workers, &cancel, report)?;

		let storage = self.storage.clone();
		let cleanup_interval = Duration::from_secs(self.config.storage.cleanup_interval_seconds.max(1));
		let cleanup_handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(cleanup_interval);
			loop {
				interval.tick().await;
				match storage.cleanup_expired().await {
					Ok(count) if count > 0 => {
						tracing::debug!(removed = count, "Storage cleanup");
					},
					Err(e) => {
						tracing::warn!(error = %e, "Storage cleanup failed");
					},
					_ => {},
				}
			}
		});

		let monitor = BalanceMonitor::new(
			self.config.destination.name.clone(),
			self.destination.clone(),
			self.delivery.sender(),
			self.storage.clone(),
			Duration::from_secs(self.config.monitor.balance_poll_interval_seconds.max(1)),
		)
		.with_min_balance(self.config.monitor.min_balance);
		let monitor_handle = tokio::spawn(monitor.run(cancel.clone()));

		let outcome = tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("Received shutdown signal");
				Ok(())
			},
			_ = self.shutdown.cancelled() => {
				tracing::info!("Shutdown requested");
				Ok(())
			},
			Some(joined) = workers.join_next() => Err(worker_outcome(joined)),
		};

		cancel.cancel();
		cleanup_handle.abort();
		monitor_handle.abort();
		self.join_workers(&mut workers).await;

		match &outcome {
			Ok(()) => tracing::info!("Relay stopped"),
			Err(e) => tracing::error!(error = %e, "Relay stopped on critical error"),
		}
		outcome.map_err(RelayError::from)
	}

	fn spawn_pipeline(
		&self,
		workers: &mut WorkerSet,
		cancel: &CancellationToken,
		report: RecoveryReport,
	) -> Result<(), RelayError> {
		let pipeline = &self.config.pipeline;
		let source_config = &self.config.source;
		let destination_config = &self.config.destination;
		let poll_interval = Duration::from_millis(pipeline.poll_interval_ms);
		let capacity = pipeline.queue_capacity.max(1);

		let source_tip = self.tip_state(source_config, &self.source_tip);
		let destination_tip = self.tip_state(destination_config, &self.destination_tip);
		let source_rx = source_tip.subscribe();
		let destination_rx = destination_tip.subscribe();
		spawn(workers, "source_tip", source_tip.run(cancel.clone()));
		spawn(workers, "destination_tip", destination_tip.run(cancel.clone()));

		let (sign_tx, sign_rx) = mpsc::channel(capacity);
		let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
		let (collect_tx, collect_rx) = mpsc::channel(capacity);
		let (finalize_tx, finalize_rx) = mpsc::channel(capacity);

		let bundling = BundlingPolicy::from_config(source_config, &self.config.bundling)
			.map_err(|e| RelayError::Config(e.to_string()))?;
		let unbundling = UnbundlingPolicy::new(
			destination_config.hasher,
			destination_config.bridge_contract,
			&pipeline.processed_event,
			&pipeline.distributed_event,
		);
		let included = EventFilter::new(
			destination_config.hasher,
			destination_config.bridge_contract,
			&pipeline.included_event,
		);

		let watcher = SourceWatcher::new(
			self.source.clone(),
			source_rx,
			self.storage.clone(),
			bundling,
			&self.config.bundling,
			sign_tx,
		);
		spawn(workers, "source", watcher.run(cancel.clone()));

		let sign = SignStage::new(
			self.signatories.clone(),
			self.storage.clone(),
			RetryBuilder::new("source check")
				.max_attempts(pipeline.submit_retry_attempts)
				.sleep(Duration::from_millis(pipeline.submit_retry_sleep_ms))
				.build(),
			RetryBuilder::new("signatures")
				.max_attempts(DEFAULT_MAX_ATTEMPTS)
				.sleep(DEFAULT_RETRY_SLEEP)
				.reject_if(signatures_unusable)
				.build(),
		);
		let sign = StageRunner::new(sign, Inbox::new(sign_rx).with_backlog(report.to_sign), poll_interval)
			.with_output(broadcast_tx, pipeline.slot_reserve);
		spawn(workers, "sign", sign.run(cancel.clone()));

		let broadcast = BroadcastStage::new(
			self.delivery.clone(),
			self.storage.clone(),
			destination_rx.clone(),
			RetryBuilder::new("submit")
				.max_attempts(pipeline.submit_retry_attempts)
				.sleep(Duration::from_millis(pipeline.submit_retry_sleep_ms))
				.build(),
		);
		let broadcast = StageRunner::new(
			broadcast,
			Inbox::new(broadcast_rx).with_backlog(report.to_broadcast),
			poll_interval,
		)
		.with_output(collect_tx, 1)
		.with_tip(destination_rx.clone());
		spawn(workers, "broadcast", broadcast.run(cancel.clone()));

		let collect = CollectReceiptsStage::new(
			self.destination.clone(),
			self.delivery.clone(),
			self.storage.clone(),
			destination_rx.clone(),
			RetryBuilder::new("receipt")
				.max_attempts(pipeline.receipt_retry_attempts)
				.sleep(Duration::from_millis(pipeline.receipt_retry_sleep_ms))
				.reject_if(receipt_missing)
				.build(),
			unbundling.clone(),
			included,
			pipeline.min_depth,
		);
		let collect = StageRunner::new(
			collect,
			Inbox::new(collect_rx).with_backlog(report.to_collect),
			poll_interval,
		)
		.with_output(finalize_tx, 1)
		.with_tip(destination_rx.clone());
		spawn(workers, "collect_receipts", collect.run(cancel.clone()));

		let finalize = FinalizeStage::new(
			self.destination.clone(),
			self.storage.clone(),
			destination_rx.clone(),
			RetryBuilder::new("finalize receipt")
				.max_attempts(pipeline.receipt_retry_attempts)
				.sleep(Duration::from_millis(pipeline.finalize_retry_sleep_ms))
				.reject_if(receipt_missing)
				.build(),
			unbundling,
			pipeline.finalization_depth,
		);
		let finalize = StageRunner::new(
			finalize,
			Inbox::new(finalize_rx).with_backlog(report.to_finalize),
			poll_interval,
		)
		.with_tip(destination_rx);
		spawn(workers, "finalize", finalize.run(cancel.clone()));

		tracing::info!(workers = workers.len(), queue_capacity = capacity, "Pipeline started");
		Ok(())
	}

	fn tip_state(&self, chain: &ChainConfig, collector: &Arc<BlockNumberCollector>) -> TipState {
		let tip = TipState::new(
			chain.name.clone(),
			collector.clone(),
			Duration::from_millis(chain.tip_poll_interval_ms),
			chain.shutdown_on_tip_error,
		);
		if chain.persist_tip {
			tip.with_storage(self.storage.clone())
		} else {
			tip
		}
	}

	/// Waits for the workers to unwind, aborting them after the shutdown
	/// timeout.
	async fn join_workers(&self, workers: &mut WorkerSet) {
		let timeout = Duration::from_secs(self.config.relay.shutdown_timeout_seconds);
		let drain = async {
			while let Some(joined) = workers.join_next().await {
				match joined {
					Ok((name, Ok(()))) => tracing::debug!(worker = name, "Worker stopped"),
					Ok((name, Err(e))) => tracing::warn!(worker = name, error = %e, "Worker failed during shutdown"),
					Err(e) if e.is_cancelled() => {},
					Err(e) => tracing::warn!(error = %e, "Worker panicked during shutdown"),
				}
			}
		};
		if tokio::time::timeout(timeout, drain).await.is_err() {
			tracing::warn!(remaining = workers.len(), "Workers did not stop in time, aborting");
			workers.abort_all();
		}
	}
}

fn spawn<F>(workers: &mut WorkerSet, name: &'static str, worker: F)
where
	F: Future<Output = Result<(), CriticalError>> + Send + 'static,
{
	workers.spawn(async move { (name, worker.await) });
}

/// Turns the first finished worker into the error that stops the relay.
/// Workers only return on their own when something went wrong.
fn worker_outcome(
	joined: Result<(&'static str, Result<(), CriticalError>), tokio::task::JoinError>,
) -> CriticalError {
	match joined {
		Ok((_, Err(e))) => e,
		Ok((name, Ok(()))) => CriticalError::new(name, "Worker stopped unexpectedly"),
		Err(e) => CriticalError::new(ENGINE, format!("Worker panicked: {}", e)),
	}
}
