//! Predicate gating.

use std::fmt;

use async_trait::async_trait;
use tether_scope::{Result, ScopeKey};
use tokio_util::sync::CancellationToken;

use crate::processor::{AsyncDataProcessor, DataProcessor, Processed};

/// Runs `inner` only for targets accepted by `predicate`.
///
/// The filter registers no scope of its own, so the predicate must give the same answer
/// for every target sharing a scope configuration.
pub struct FilterProcessor<F, P> {
	predicate: F,
	inner: P,
}

impl<F, P> FilterProcessor<F, P> {
	pub fn new(predicate: F, inner: P) -> Self {
		Self { predicate, inner }
	}

	pub fn inner(&self) -> &P {
		&self.inner
	}
}

impl<T, I, D, F, P> DataProcessor<T, I, D> for FilterProcessor<F, P>
where
	T: ?Sized,
	I: ?Sized,
	F: Fn(&T) -> bool + Send + Sync,
	P: DataProcessor<T, I, D>,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		if (self.predicate)(target) { self.inner.register_scopes(target, key) } else { Ok(()) }
	}

	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool> {
		if (self.predicate)(target) { self.inner.process_data(target, key, id, data) } else { Ok(false) }
	}
}

#[async_trait]
impl<T, I, D, F, P> AsyncDataProcessor<T, I, D> for FilterProcessor<F, P>
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
	F: Fn(&T) -> bool + Send + Sync,
	P: AsyncDataProcessor<T, I, D>,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		if (self.predicate)(target) { self.inner.register_scopes(target, key) } else { Ok(()) }
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		if (self.predicate)(target) {
			self.inner.process_data_async(target, key, id, data, cancel).await
		} else {
			Ok(Processed::unchanged(data))
		}
	}
}

impl<F, P: fmt::Debug> fmt::Debug for FilterProcessor<F, P> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FilterProcessor").field("inner", &self.inner).finish_non_exhaustive()
	}
}
