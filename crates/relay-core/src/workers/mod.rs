//! Pipeline workers.
//!
//! Bundle stages share one driver, [`StageRunner`]. The runner keeps the
//! bundle at the head of its input in a local slot until the stage is done
//! with it, so a later bundle never overtakes an unresolved earlier one.
//! Bundles left over from a previous run are replayed ahead of the channel.

use crate::policy::UnbundlingPolicy;
use crate::retry::RetryExecutor;
use crate::CriticalError;
use async_trait::async_trait;
use relay_chain::ChainConnection;
use relay_types::{Receipt, StatefulBundle, B256};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub mod broadcast;
pub mod collect_receipts;
pub mod finalize;
pub mod sign;
pub mod source;

pub use broadcast::BroadcastStage;
pub use collect_receipts::CollectReceiptsStage;
pub use finalize::FinalizeStage;
pub use sign::SignStage;
pub use source::SourceWatcher;

/// What the runner does with the head bundle after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	/// Keep the bundle and try again after the tip moves or the poll
	/// interval passes.
	Wait,
	/// Keep the bundle and try again right away.
	Again,
	/// Remove the bundle and hand it to the next stage.
	Advance,
}

/// One step of the bundle pipeline.
#[async_trait]
pub trait Stage: Send {
	fn name(&self) -> &'static str;

	/// Works on the head bundle. Errors stop the pipeline.
	async fn process(&mut self, bundle: &mut StatefulBundle) -> Result<Step, CriticalError>;
}

/// Input of a stage: replayed bundles first, then the channel.
pub struct Inbox {
	backlog: VecDeque<StatefulBundle>,
	receiver: mpsc::Receiver<StatefulBundle>,
	head: Option<StatefulBundle>,
}

impl Inbox {
	pub fn new(receiver: mpsc::Receiver<StatefulBundle>) -> Self {
		Self {
			backlog: VecDeque::new(),
			receiver,
			head: None,
		}
	}

	pub fn with_backlog(mut self, backlog: impl IntoIterator<Item = StatefulBundle>) -> Self {
		self.backlog.extend(backlog);
		self
	}

	/// Waits for a head bundle without removing it. `None` once the input is
	/// closed and drained, or on cancellation.
	pub async fn peek(&mut self, cancel: &CancellationToken) -> Option<&mut StatefulBundle> {
		if self.head.is_none() {
			let next = match self.backlog.pop_front() {
				Some(bundle) => Some(bundle),
				None => tokio::select! {
					_ = cancel.cancelled() => None,
					next = self.receiver.recv() => next,
				},
			};
			self.head = Some(next?);
		}
		self.head.as_mut()
	}

	/// Removes the head bundle.
	pub fn take(&mut self) -> Option<StatefulBundle> {
		self.head.take()
	}
}

/// Drives a [`Stage`] over its inbox.
pub struct StageRunner<S> {
	stage: S,
	inbox: Inbox,
	output: Option<mpsc::Sender<StatefulBundle>>,
	/// Free output slots required before a bundle is picked up.
	slot_reserve: usize,
	poll_interval: Duration,
	tip: Option<watch::Receiver<Option<u64>>>,
}

impl<S: Stage> StageRunner<S> {
	pub fn new(stage: S, inbox: Inbox, poll_interval: Duration) -> Self {
		Self {
			stage,
			inbox,
			output: None,
			slot_reserve: 0,
			poll_interval,
			tip: None,
		}
	}

	pub fn with_output(mut self, output: mpsc::Sender<StatefulBundle>, slot_reserve: usize) -> Self {
		self.output = Some(output);
		self.slot_reserve = slot_reserve;
		self
	}

	/// Wakes waiting passes whenever the tip changes.
	pub fn with_tip(mut self, tip: watch::Receiver<Option<u64>>) -> Self {
		self.tip = Some(tip);
		self
	}

	pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CriticalError> {
		let name = self.stage.name();
		tracing::debug!(worker = name, "Started");
		loop {
			if cancel.is_cancelled() {
				break;
			}
			if let Some(output) = &self.output {
				if output.is_closed() {
					break;
				}
				if output.capacity() < self.slot_reserve {
					if !self.pause(&cancel).await {
						break;
					}
					continue;
				}
			}

			let Some(bundle) = self.inbox.peek(&cancel).await else {
				break;
			};
			let step = tokio::select! {
				_ = cancel.cancelled() => break,
				step = self.stage.process(bundle) => step?,
			};

			match step {
				Step::Wait => {
					if !self.pause(&cancel).await {
						break;
					}
				},
				Step::Again => {},
				Step::Advance => {
					let Some(bundle) = self.inbox.take() else {
						continue;
					};
					if let Some(output) = &self.output {
						let sent = tokio::select! {
							_ = cancel.cancelled() => break,
							sent = output.send(bundle) => sent,
						};
						if sent.is_err() {
							break;
						}
					}
				},
			}
		}
		tracing::debug!(worker = name, "Stopped");
		Ok(())
	}

	/// Sleeps until the tip changes or the poll interval passes. False on
	/// cancellation.
	async fn pause(&mut self, cancel: &CancellationToken) -> bool {
		let tip = self.tip.as_mut();
		let tip_changed = async move {
			if let Some(tip) = tip {
				if tip.changed().await.is_ok() {
					return;
				}
			}
			std::future::pending::<()>().await
		};
		tokio::select! {
			_ = cancel.cancelled() => false,
			_ = tip_changed => true,
			_ = tokio::time::sleep(self.poll_interval) => true,
		}
	}
}

/// Blocks between `height` and `tip`, `None` when `height` is above the tip.
pub(crate) fn depth(tip: u64, height: u64) -> Option<u64> {
	tip.checked_sub(height)
}

/// Fetches a receipt, retrying while it is missing.
pub(crate) async fn fetch_receipt(
	connection: &dyn ChainConnection,
	retry: &RetryExecutor<Option<Receipt>>,
	tx_hash: B256,
) -> Option<Receipt> {
	retry
		.execute(|| connection.get_receipt(tx_hash))
		.await
		.flatten()
}

/// Checks that `receipt` paid out exactly the transfers of `bundle`.
pub(crate) fn verify_unbundled(
	worker: &'static str,
	policy: &UnbundlingPolicy,
	bundle: &StatefulBundle,
	receipt: &Receipt,
) -> Result<(), CriticalError> {
	let decoded = policy
		.from_receipt(receipt)
		.map_err(|e| CriticalError::bundle(worker, bundle, format!("Failed to decode receipt: {}", e)))?;

	match decoded.as_slice() {
		[single]
			if single.bundle_hash() == bundle.bundle_hash()
				&& bundle.bundle().same_transfers(single.transfers()) =>
		{
			Ok(())
		},
		[single] => Err(CriticalError::bundle(
			worker,
			bundle,
			format!(
				"Receipt {} paid out {} transfers that do not match the bundle",
				receipt.transaction_hash,
				single.transfers().len()
			),
		)),
		other => Err(CriticalError::bundle(
			worker,
			bundle,
			format!(
				"Receipt {} carries {} bundles, expected 1",
				receipt.transaction_hash,
				other.len()
			),
		)),
	}
}


#[cfg(test)]
mod tests {
	use super::test_support::*;
	use super::*;
	use relay_types::Bundle;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	/// Waits `waits` passes on every bundle, then advances it.
	struct Counting {
		waits: usize,
		passes: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Stage for Counting {
		fn name(&self) -> &'static str {
			"counting"
		}

		async fn process(&mut self, _bundle: &mut StatefulBundle) -> Result<Step, CriticalError> {
			let pass = self.passes.fetch_add(1, Ordering::SeqCst);
			if pass < self.waits {
				Ok(Step::Wait)
			} else {
				Ok(Step::Advance)
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_runner_keeps_order_and_replays_backlog_first() {
		let (in_tx, in_rx) = mpsc::channel(4);
		let (out_tx, mut out_rx) = mpsc::channel(4);
		let passes = Arc::new(AtomicUsize::new(0));
		let runner = StageRunner::new(
			Counting {
				waits: 2,
				passes: passes.clone(),
			},
			Inbox::new(in_rx).with_backlog([stored_bundle(1)]),
			Duration::from_millis(5),
		)
		.with_output(out_tx, 1);

		in_tx.send(stored_bundle(2)).await.unwrap();
		drop(in_tx);
		runner.run(CancellationToken::new()).await.unwrap();

		assert_eq!(out_rx.recv().await.unwrap().id(), 1);
		assert_eq!(out_rx.recv().await.unwrap().id(), 2);
		// Two waits on the first bundle, then one pass each.
		assert_eq!(passes.load(Ordering::SeqCst), 4);
	}

	#[tokio::test(start_paused = true)]
	async fn test_runner_stops_on_cancel_while_waiting() {
		let (_in_tx, in_rx) = mpsc::channel(1);
		let runner = StageRunner::new(
			Counting {
				waits: usize::MAX,
				passes: Arc::new(AtomicUsize::new(0)),
			},
			Inbox::new(in_rx).with_backlog([stored_bundle(1)]),
			Duration::from_secs(1),
		);
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(runner.run(cancel.clone()));
		tokio::time::sleep(Duration::from_secs(3)).await;
		cancel.cancel();
		assert!(handle.await.unwrap().is_ok());
	}

	#[test]
	fn test_unbundle_check() {
		let bundle = submitted_bundle(1, 10, B256::repeat_byte(7));
		let good = mined(12, B256::repeat_byte(7), payout_logs(&bundle));
		assert!(verify_unbundled("test", &unbundling(), &bundle, &good).is_ok());

		let mut logs = payout_logs(&bundle);
		logs.remove(0);
		let short = mined(12, B256::repeat_byte(7), logs);
		assert!(verify_unbundled("test", &unbundling(), &bundle, &short).is_err());
	}

	#[test]
	fn test_duplicated_payout_fails_unbundle_check() {
		let bundle = submitted_bundle(1, 10, B256::repeat_byte(7));
		let mut logs = payout_logs(&bundle);
		// Pay the first transfer twice and never pay the second.
		logs[1] = logs[0].clone();
		let doubled = mined(12, B256::repeat_byte(7), logs);
		assert!(verify_unbundled("test", &unbundling(), &bundle, &doubled).is_err());
	}

	#[test]
	fn test_payout_for_another_bundle_fails_unbundle_check() {
		let bundle = submitted_bundle(1, 10, B256::repeat_byte(7));
		let other = StatefulBundle::new(
			2,
			Bundle::new(5, B256::repeat_byte(6), 0, transfers()),
		);
		let foreign = mined(12, B256::repeat_byte(7), payout_logs(&other));
		assert!(verify_unbundled("test", &unbundling(), &bundle, &foreign).is_err());
	}
}
