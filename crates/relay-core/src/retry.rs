//! Fixed-interval retries with a result predicate.
//!
//! An attempt fails when the operation errors or when its result is
//! rejected by the predicate. Running out of attempts yields `None`; the
//! caller decides whether that is fatal.

use backoff::backoff::Backoff;
use relay_types::{BundleSignature, Receipt};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Default sleep between attempts.
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Default number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Backoff policy returning a constant interval until the retry count is
/// used up.
#[derive(Debug)]
pub struct ConstantWithMaxRetryCount {
	interval: Duration,
	max_retry_count: usize,
	count: usize,
}

impl ConstantWithMaxRetryCount {
	pub fn new(interval: Duration, max_retry_count: usize) -> Self {
		Self {
			interval,
			max_retry_count,
			count: 0,
		}
	}
}

impl Backoff for ConstantWithMaxRetryCount {
	fn next_backoff(&mut self) -> Option<Duration> {
		if self.count < self.max_retry_count {
			self.count += 1;
			Some(self.interval)
		} else {
			None
		}
	}

	fn reset(&mut self) {
		self.count = 0;
	}
}

/// Retries an operation until its result is accepted.
#[derive(Debug, Clone)]
pub struct RetryExecutor<T> {
	label: &'static str,
	max_attempts: usize,
	sleep: Duration,
	reject: fn(&T) -> bool,
}

impl<T> RetryExecutor<T> {
	pub fn max_attempts(&self) -> usize {
		self.max_attempts
	}

	/// Calls `operation` up to `max_attempts` times, sleeping only between
	/// attempts. Returns the first accepted result.
	pub async fn execute<E, F, Fut>(&self, mut operation: F) -> Option<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Display,
	{
		let mut backoff = ConstantWithMaxRetryCount::new(self.sleep, self.max_attempts.saturating_sub(1));
		let mut attempt = 0usize;
		loop {
			attempt += 1;
			match operation().await {
				Ok(result) if !(self.reject)(&result) => return Some(result),
				Ok(_) => {
					tracing::debug!(operation = self.label, attempt, "Result rejected");
				},
				Err(e) => {
					tracing::warn!(operation = self.label, attempt, error = %e, "Attempt failed");
				},
			}
			match backoff.next_backoff() {
				Some(delay) => tokio::time::sleep(delay).await,
				None => {
					tracing::warn!(operation = self.label, attempts = attempt, "Retries exhausted");
					return None;
				},
			}
		}
	}
}

/// Builder for [`RetryExecutor`].
pub struct RetryBuilder<T> {
	label: &'static str,
	max_attempts: usize,
	sleep: Duration,
	reject: fn(&T) -> bool,
}

impl<T> RetryBuilder<T> {
	pub fn new(label: &'static str) -> Self {
		Self {
			label,
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			sleep: DEFAULT_RETRY_SLEEP,
			reject: accept_all::<T>,
		}
	}

	/// At least one attempt is always made.
	pub fn max_attempts(mut self, max_attempts: usize) -> Self {
		self.max_attempts = max_attempts.max(1);
		self
	}

	pub fn sleep(mut self, sleep: Duration) -> Self {
		self.sleep = sleep;
		self
	}

	/// Results for which `reject` returns true are retried.
	pub fn reject_if(mut self, reject: fn(&T) -> bool) -> Self {
		self.reject = reject;
		self
	}

	pub fn build(self) -> RetryExecutor<T> {
		RetryExecutor {
			label: self.label,
			max_attempts: self.max_attempts,
			sleep: self.sleep,
			reject: self.reject,
		}
	}
}

/// Accepts every result.
pub fn accept_all<T>(_: &T) -> bool {
	false
}

/// Rejects a receipt lookup that found nothing.
pub fn receipt_missing(receipt: &Option<Receipt>) -> bool {
	receipt.is_none()
}

/// Rejects empty signature sets and sets signed twice by one signatory.
#[allow(clippy::ptr_arg)]
pub fn signatures_unusable(signatures: &Vec<BundleSignature>) -> bool {
	signatures.is_empty() || !relay_signer::distinct_signers(signatures)
}
