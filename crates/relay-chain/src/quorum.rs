//! Fan-out of one logical call over N independent sources.
//!
//! Every source is called concurrently. A source that fails counts as "no
//! response"; its error is logged and swallowed, so sources may use any
//! error type. As soon as the outcome is decided, the remaining calls are
//! dropped, which cancels them. A zero timeout disables the deadline.

use crate::ChainError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};

/// Runs one operation over a fixed set of sources under a quorum rule.
pub struct QuorumAggregator<C: ?Sized> {
	sources: Vec<Arc<C>>,
	quorum: usize,
	/// Shared bound on concurrent calls, across every aggregator holding it.
	limiter: Option<Arc<Semaphore>>,
}

impl<C: ?Sized> Clone for QuorumAggregator<C> {
	fn clone(&self) -> Self {
		Self {
			sources: self.sources.clone(),
			quorum: self.quorum,
			limiter: self.limiter.clone(),
		}
	}
}

/// When a collect round stops waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
	Quorum,
	Drained,
}

impl<C: ?Sized + Send + Sync> QuorumAggregator<C> {
	/// Requires at least one source and `1 <= quorum <= sources.len()`.
	pub fn new(sources: Vec<Arc<C>>, quorum: usize) -> Result<Self, ChainError> {
		if sources.is_empty() {
			return Err(ChainError::InvalidConfiguration(
				"At least one source is required".into(),
			));
		}
		if quorum == 0 || quorum > sources.len() {
			return Err(ChainError::InvalidConfiguration(format!(
				"Quorum must be between 1 and {}, got {}",
				sources.len(),
				quorum
			)));
		}
		Ok(Self {
			sources,
			quorum,
			limiter: None,
		})
	}

	/// Bounds the number of calls in flight with a semaphore shared by the caller.
	pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
		self.limiter = Some(limiter);
		self
	}

	pub fn sources(&self) -> &[Arc<C>] {
		&self.sources
	}

	pub fn quorum(&self) -> usize {
		self.quorum
	}

	/// Collects responses from every source until all have answered or the
	/// deadline passes. Fails unless at least `quorum` succeeded.
	pub async fn collect_all<T, E, F, Fut>(&self, timeout: Duration, call: F) -> Result<Vec<T>, ChainError>
	where
		F: Fn(Arc<C>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Display,
	{
		self.collect(timeout, Until::Drained, call).await
	}

	/// Like [`collect_all`](Self::collect_all), but returns as soon as
	/// `quorum` responses are in.
	pub async fn collect_quorum<T, E, F, Fut>(&self, timeout: Duration, call: F) -> Result<Vec<T>, ChainError>
	where
		F: Fn(Arc<C>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Display,
	{
		self.collect(timeout, Until::Quorum, call).await
	}

	/// Returns the first value reported identically by `quorum` sources.
	///
	/// `Ok(None)` from a source is a regular value here, so a quorum of
	/// nodes can agree that something does not exist.
	pub async fn consolidate<T, E, F, Fut>(&self, timeout: Duration, call: F) -> Result<T, ChainError>
	where
		T: PartialEq,
		F: Fn(Arc<C>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Display,
	{
		let deadline = deadline(timeout);
		let mut pending = self.fan_out(&call);
		let mut tally: Vec<(T, usize)> = Vec::new();
		let mut responses = 0;

		while let Some(result) = next(&mut pending, deadline).await {
			let value = match result {
				Ok(value) => value,
				Err(e) => {
					tracing::trace!(error = %e, "Source failed during consolidation");
					continue;
				},
			};
			responses += 1;

			let position = match tally.iter().position(|(seen, _)| *seen == value) {
				Some(i) => {
					tally[i].1 += 1;
					i
				},
				None => {
					tally.push((value, 1));
					tally.len() - 1
				},
			};

			if tally[position].1 >= self.quorum {
				return Ok(tally.swap_remove(position).0);
			}
		}

		Err(ChainError::QuorumNotAvailable {
			responses,
			cancelled: pending.len(),
			quorum: self.quorum,
		})
	}

	async fn collect<T, E, F, Fut>(&self, timeout: Duration, until: Until, call: F) -> Result<Vec<T>, ChainError>
	where
		F: Fn(Arc<C>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Display,
	{
		let deadline = deadline(timeout);
		let mut pending = self.fan_out(&call);
		let mut responses = Vec::with_capacity(self.sources.len());

		while let Some(result) = next(&mut pending, deadline).await {
			match result {
				Ok(value) => responses.push(value),
				Err(e) => tracing::debug!(error = %e, "Source failed during collection"),
			}
			if until == Until::Quorum && responses.len() >= self.quorum {
				break;
			}
		}

		if responses.len() < self.quorum {
			return Err(ChainError::QuorumNotAvailable {
				responses: responses.len(),
				cancelled: pending.len(),
				quorum: self.quorum,
			});
		}
		Ok(responses)
	}

	fn fan_out<'a, T, E, F, Fut>(
		&'a self,
		call: &'a F,
	) -> FuturesUnordered<impl Future<Output = Result<T, E>> + 'a>
	where
		T: 'a,
		E: 'a,
		F: Fn(Arc<C>) -> Fut,
		Fut: Future<Output = Result<T, E>> + 'a,
	{
		self.sources
			.iter()
			.map(|source| {
				let source = Arc::clone(source);
				let limiter = self.limiter.clone();
				async move {
					// A closed limiter no longer bounds anything.
					let _permit = match limiter {
						Some(limiter) => limiter.acquire_owned().await.ok(),
						None => None,
					};
					call(source).await
				}
			})
			.collect()
	}
}

fn deadline(timeout: Duration) -> Option<Instant> {
	(!timeout.is_zero()).then(|| Instant::now() + timeout)
}

/// Next finished call, or `None` once everything finished or the deadline passed.
async fn next<S>(pending: &mut S, deadline: Option<Instant>) -> Option<S::Item>
where
	S: futures::Stream + Unpin,
{
	match deadline {
		Some(deadline) => timeout_at(deadline, pending.next()).await.ok().flatten(),
		None => pending.next().await,
	}
}
