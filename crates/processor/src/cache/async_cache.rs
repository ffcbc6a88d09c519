use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_scope::{Error, Result, ScopeContext, ScopeKey, ScopedCache, ScopedValue};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::processor::{AsyncDataProcessor, Processed, SharedAsyncProcessor};

type Shared<D> = Option<Result<Processed<D>>>;

/// A computation in progress, shared by every requester of the same id.
struct InFlight<D> {
	tx: watch::Sender<Shared<D>>,
	rx: watch::Receiver<Shared<D>>,
}

enum Slot<D> {
	Pending(Arc<InFlight<D>>),
	Resolved(Processed<D>),
}

/// Inner table of one scope configuration.
///
/// Entries move from absent to pending to resolved. Eviction cancels `cancel`, which
/// aborts every pending computation, and clears the table.
struct AsyncTable<I, D> {
	cancel: CancellationToken,
	slots: Mutex<FxHashMap<I, Slot<D>>>,
}

enum Claim<D> {
	Resolved(Processed<D>),
	Wait(watch::Receiver<Shared<D>>),
	Lead(Arc<InFlight<D>>),
}

impl<I: Clone + Eq + Hash, D: Clone> AsyncTable<I, D> {
	fn new() -> Self {
		Self {
			cancel: CancellationToken::new(),
			slots: Mutex::new(FxHashMap::default()),
		}
	}

	fn claim(&self, id: &I) -> Claim<D> {
		let mut slots = self.slots.lock();
		match slots.get(id) {
			Some(Slot::Resolved(result)) => Claim::Resolved(result.clone()),
			Some(Slot::Pending(flight)) => Claim::Wait(flight.rx.clone()),
			None => {
				let (tx, rx) = watch::channel(None);
				let flight = Arc::new(InFlight { tx, rx });
				slots.insert(id.clone(), Slot::Pending(Arc::clone(&flight)));
				Claim::Lead(flight)
			}
		}
	}
}

impl<I, D> ScopedValue for AsyncTable<I, D>
where
	I: Send + Sync + 'static,
	D: Send + Sync + 'static,
{
	fn evict(&self) {
		self.cancel.cancel();
		let mut slots = self.slots.lock();
		tracing::debug!(entries = slots.len(), "processor_cache.cancel");
		slots.clear();
	}
}

/// Publishes the leader's outcome. If the leader exits without completing, waiters
/// are told to retry and the pending slot is removed.
struct LeadGuard<'a, I: Eq + Hash, D: Clone> {
	table: &'a AsyncTable<I, D>,
	id: &'a I,
	flight: Arc<InFlight<D>>,
	completed: bool,
}

impl<I: Eq + Hash, D: Clone> LeadGuard<'_, I, D> {
	fn complete(mut self, result: Result<Processed<D>>) {
		self.completed = true;
		{
			let mut slots = self.table.slots.lock();
			if let Some(slot) = slots.get_mut(self.id)
				&& matches!(&*slot, Slot::Pending(flight) if Arc::ptr_eq(flight, &self.flight))
			{
				match &result {
					Ok(processed) if !self.table.cancel.is_cancelled() => *slot = Slot::Resolved(processed.clone()),
					_ => {
						slots.remove(self.id);
					}
				}
			}
		}
		let _ = self.flight.tx.send(Some(result));
	}
}

impl<I: Eq + Hash, D: Clone> Drop for LeadGuard<'_, I, D> {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		{
			let mut slots = self.table.slots.lock();
			if matches!(slots.get(self.id), Some(Slot::Pending(flight)) if Arc::ptr_eq(flight, &self.flight)) {
				slots.remove(self.id);
			}
		}
		let _ = self.flight.tx.send(Some(Err(Error::Aborted)));
	}
}

enum Outcome<D> {
	Done(Result<Processed<D>>),
	Retry,
}

/// Memoizes an async processor per scope configuration and identifier.
///
/// Concurrent requests for the same configuration and id share one computation. When
/// any scope of the configuration is invalidated, in-flight computations for it are
/// cancelled and their requesters retry against the new configuration. A failed
/// computation is delivered to everyone awaiting it and then forgotten.
pub struct AsyncDataProcessorCache<T: ?Sized, I, D> {
	processor: SharedAsyncProcessor<T, I, D>,
	tables: ScopedCache<T, AsyncTable<I, D>>,
}

impl<T, I, D> AsyncDataProcessorCache<T, I, D>
where
	T: ?Sized + Sync + 'static,
	I: Clone + Eq + Hash + Send + Sync + 'static,
	D: Clone + Send + Sync + 'static,
{
	pub fn new(context: &ScopeContext, processor: SharedAsyncProcessor<T, I, D>) -> Self {
		let registrar = Arc::clone(&processor);
		let tables = ScopedCache::new(
			context,
			move |target: &T, key: &ScopeKey| -> Result<bool> {
				registrar.register_scopes(target, key)?;
				Ok(key.scope_count() > 0)
			},
			|_: &T, _: &ScopeKey| Ok(AsyncTable::new()),
		);
		Self { processor, tables }
	}

	/// Number of scope configurations currently cached.
	pub fn len(&self) -> usize {
		self.tables.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tables.is_empty()
	}

	/// Drops every cached result, cancels pending work and rejects further processing.
	pub fn dispose(&self) {
		self.tables.dispose();
	}

	async fn lead(
		&self,
		table: &AsyncTable<I, D>,
		flight: Arc<InFlight<D>>,
		(target, key, id): (&T, &ScopeKey, &I),
		data: D,
		cancel: &CancellationToken,
	) -> Outcome<D> {
		let guard = LeadGuard {
			table,
			id,
			flight,
			completed: false,
		};
		let token = table.cancel.child_token();
		let result = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				token.cancel();
				return Outcome::Done(Err(Error::Cancelled));
			}
			_ = table.cancel.cancelled() => Err(Error::Cancelled),
			result = self.processor.process_data_async(target, key, id, data, &token) => result,
		};
		if table.cancel.is_cancelled() {
			tracing::debug!("processor_cache.leader_cancelled");
			guard.complete(Err(Error::Cancelled));
			return Outcome::Retry;
		}
		guard.complete(result.clone());
		Outcome::Done(result)
	}
}

/// Waits for a leader's outcome.
async fn follow<I, D: Clone>(table: &AsyncTable<I, D>, mut rx: watch::Receiver<Shared<D>>, cancel: &CancellationToken) -> Outcome<D> {
	loop {
		let current = rx.borrow_and_update().clone();
		if let Some(result) = current {
			return match result {
				Err(Error::Aborted) => Outcome::Retry,
				Err(_) if table.cancel.is_cancelled() => Outcome::Retry,
				result => Outcome::Done(result),
			};
		}
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return Outcome::Done(Err(Error::Cancelled)),
			changed = rx.changed() => {
				if changed.is_err() {
					return Outcome::Retry;
				}
			}
		}
	}
}

#[async_trait]
impl<T, I, D> AsyncDataProcessor<T, I, D> for AsyncDataProcessorCache<T, I, D>
where
	T: ?Sized + Sync + 'static,
	I: Clone + Eq + Hash + Send + Sync + 'static,
	D: Clone + Send + Sync + 'static,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		self.processor.register_scopes(target, key)
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}
			let Some(table) = self.tables.get_scoped_data(target, Some(key), false)? else {
				return self.processor.process_data_async(target, key, id, data, cancel).await;
			};
			let claim = table.claim(id);
			let outcome = match claim {
				Claim::Resolved(result) => return Ok(result),
				Claim::Wait(rx) => {
					tracing::trace!("processor_cache.join");
					follow(&table, rx, cancel).await
				}
				Claim::Lead(flight) => self.lead(&table, flight, (target, key, id), data.clone(), cancel).await,
			};
			match outcome {
				Outcome::Done(result) => return result,
				Outcome::Retry => tracing::debug!("processor_cache.retry"),
			}
		}
	}
}

impl<T: ?Sized, I, D> fmt::Debug for AsyncDataProcessorCache<T, I, D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AsyncDataProcessorCache").field("tables", &self.tables).finish_non_exhaustive()
	}
}
