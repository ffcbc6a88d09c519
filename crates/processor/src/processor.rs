//! Processor contracts.

use std::sync::Arc;

use async_trait::async_trait;
use tether_scope::{Result, ScopeKey};
use tokio_util::sync::CancellationToken;

/// Result of an async processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed<D> {
	/// Whether any processor changed the data.
	pub modified: bool,
	pub data: D,
}

impl<D> Processed<D> {
	pub fn unchanged(data: D) -> Self {
		Self { modified: false, data }
	}

	pub fn modified(data: D) -> Self {
		Self { modified: true, data }
	}
}

/// Pure transformation of `D` for a target, identified within a scope configuration by `I`.
///
/// # Precondition
///
/// Two targets that register the identical non-transparent scope set must be processed
/// identically for the same identifier. Caches rely on this to share results across
/// targets; it cannot be verified at runtime.
pub trait DataProcessor<T: ?Sized, I: ?Sized, D>: Send + Sync {
	/// Registers `key` on every scope this processor's output for `target` depends on.
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()>;

	/// Processes `data` in place. Returns whether it was modified.
	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool>;
}

/// Async counterpart of [`DataProcessor`]. Scope registration stays synchronous.
///
/// Implementations must observe `cancel` and pass it (or a child of it) to every nested
/// async computation they await.
#[async_trait]
pub trait AsyncDataProcessor<T, I, D>: Send + Sync
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
{
	/// See [`DataProcessor::register_scopes`].
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()>;

	/// Processes `data`, honoring `cancel`.
	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>>;
}

/// Shared handle to a dynamically typed sync processor.
pub type SharedProcessor<T, I, D> = Arc<dyn DataProcessor<T, I, D>>;

/// Shared handle to a dynamically typed async processor.
pub type SharedAsyncProcessor<T, I, D> = Arc<dyn AsyncDataProcessor<T, I, D>>;

impl<T, I, D, P> DataProcessor<T, I, D> for Arc<P>
where
	T: ?Sized,
	I: ?Sized,
	P: DataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		(**self).register_scopes(target, key)
	}

	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool> {
		(**self).process_data(target, key, id, data)
	}
}

#[async_trait]
impl<T, I, D, P> AsyncDataProcessor<T, I, D> for Arc<P>
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
	P: AsyncDataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		(**self).register_scopes(target, key)
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		(**self).process_data_async(target, key, id, data, cancel).await
	}
}

/// Runs a sync processor wherever an [`AsyncDataProcessor`] is expected.
///
/// The sync processor runs inline on the polling task; cancellation is checked once
/// before it starts.
#[derive(Debug, Clone)]
pub struct SyncProcessor<P>(pub P);

#[async_trait]
impl<T, I, D, P> AsyncDataProcessor<T, I, D> for SyncProcessor<P>
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
	P: DataProcessor<T, I, D>,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		self.0.register_scopes(target, key)
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, mut data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		if cancel.is_cancelled() {
			return Err(tether_scope::Error::Cancelled);
		}
		let modified = self.0.process_data(target, key, id, &mut data)?;
		Ok(Processed { modified, data })
	}
}
