//! Memoization keyed by scope configuration.
//!
//! A [`ScopedCache`] stores at most one value per distinct scope configuration. Lookups
//! build a fresh candidate [`ScopeKey`], let a [`ScopeRegistrar`] populate it, and then
//! either share the value published for an equal key or compute and publish a new one.
//! A published value lives until its key is invalidated, at which point the entry is
//! removed and [`ScopedValue::evict`] runs exactly once.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::context::ScopeContext;
use crate::key::{KeyOptions, ScopeKey, ScopeSignature};
use crate::{Error, Result};

/// Tells a key which scopes a target belongs to.
pub trait ScopeRegistrar<T: ?Sized>: Send + Sync {
	/// Registers `key` on every scope `target` depends on.
	///
	/// Returns `Ok(false)` when the target has no scope-dependent data at all.
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<bool>;
}

impl<T, F> ScopeRegistrar<T> for F
where
	T: ?Sized,
	F: Fn(&T, &ScopeKey) -> Result<bool> + Send + Sync,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<bool> {
		self(target, key)
	}
}

/// Targets that know their own scopes.
pub trait ScopedTarget {
	/// See [`ScopeRegistrar::register_scopes`].
	fn register_scopes(&self, key: &ScopeKey) -> Result<bool>;
}

/// Registrar delegating to the target's [`ScopedTarget`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfRegistrar;

impl<T: ScopedTarget + ?Sized> ScopeRegistrar<T> for SelfRegistrar {
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<bool> {
		target.register_scopes(key)
	}
}

/// Values stored in a [`ScopedCache`].
pub trait ScopedValue: Send + Sync + 'static {
	/// Tears the value down. Called exactly once, when the owning scope configuration is
	/// invalidated, the cache is disposed, or the value loses a publication race.
	fn evict(&self) {}
}

struct CacheEntry<V> {
	key: ScopeKey,
	value: Arc<V>,
}

struct Entries<V> {
	map: FxHashMap<ScopeSignature, CacheEntry<V>>,
	disposed: bool,
}

type Factory<T, V> = dyn Fn(&T, &ScopeKey) -> Result<V> + Send + Sync;

/// Cache sharing one value per scope configuration across all targets.
///
/// Callers must uphold the processor precondition: two targets registering the same
/// non-transparent scope set must be served by the same value.
pub struct ScopedCache<T: ?Sized, V> {
	context: ScopeContext,
	registrar: Box<dyn ScopeRegistrar<T>>,
	factory: Box<Factory<T, V>>,
	entries: Arc<Mutex<Entries<V>>>,
}

impl<T, V> ScopedCache<T, V>
where
	T: ?Sized + 'static,
	V: ScopedValue,
{
	/// Creates a cache populating keys through `registrar` and computing values with `factory`.
	pub fn new<R, F>(context: &ScopeContext, registrar: R, factory: F) -> Self
	where
		R: ScopeRegistrar<T> + 'static,
		F: Fn(&T, &ScopeKey) -> Result<V> + Send + Sync + 'static,
	{
		Self {
			context: context.clone(),
			registrar: Box::new(registrar),
			factory: Box::new(factory),
			entries: Arc::new(Mutex::new(Entries {
				map: FxHashMap::default(),
				disposed: false,
			})),
		}
	}

	/// Creates a cache for targets that register their own scopes.
	pub fn self_registering<F>(context: &ScopeContext, factory: F) -> Self
	where
		T: ScopedTarget,
		F: Fn(&T, &ScopeKey) -> Result<V> + Send + Sync + 'static,
	{
		Self::new(context, SelfRegistrar, factory)
	}

	pub fn context(&self) -> &ScopeContext {
		&self.context
	}

	/// Number of live entries.
	pub fn len(&self) -> usize {
		self.entries.lock().map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_disposed(&self) -> bool {
		self.entries.lock().disposed
	}

	/// Shorthand for `get_scoped_data(target, None, false)`.
	pub fn get(&self, target: &T) -> Result<Option<Arc<V>>> {
		self.get_scoped_data(target, None, false)
	}

	/// Returns the value for `target`'s current scope configuration.
	///
	/// If `caller` is given, it is registered on every scope the result depends on, so
	/// invalidating any of them also invalidates the caller's key. With `no_create_new`,
	/// a miss returns `Ok(None)` instead of computing a value.
	///
	/// A candidate key invalidated by a concurrent scope invalidation is discarded and
	/// registration restarts from scratch; this is never surfaced to the caller.
	///
	/// # Errors
	///
	/// * [`Error::Disposed`] if the cache was disposed.
	/// * [`Error::KeyMismatch`] if `caller` belongs to another context.
	/// * Any error raised by the registrar or the factory. Failed computations are never cached.
	pub fn get_scoped_data(&self, target: &T, caller: Option<&ScopeKey>, no_create_new: bool) -> Result<Option<Arc<V>>> {
		if let Some(caller) = caller
			&& !caller.context().same_as(&self.context)
		{
			return Err(Error::KeyMismatch);
		}

		let mut retries = 0u32;
		loop {
			if retries == self.context.config().retry_warn_threshold {
				tracing::warn!(retries, "scoped_cache.retry_storm");
			}
			retries = retries.saturating_add(1);

			if self.is_disposed() {
				return Err(Error::Disposed("scoped cache"));
			}

			let candidate = self.context.key_with(KeyOptions::new().invalidate_on_registrar_change(true));
			match self.registrar.register_scopes(target, &candidate) {
				Ok(true) => {}
				// Losing every scope to a concurrent invalidation looks like "no data".
				Ok(false) if !candidate.is_valid() => continue,
				Ok(false) => {
					candidate.dispose();
					return Ok(None);
				}
				Err(_) if !candidate.is_valid() => continue,
				Err(err) => {
					candidate.dispose();
					return Err(err);
				}
			}
			if let Some(caller) = caller {
				candidate.forward_to(caller)?;
			}
			if !candidate.is_valid() {
				continue;
			}

			let signature = candidate.signature();
			if let Some(value) = self.lookup(&signature)? {
				candidate.dispose();
				return Ok(Some(value));
			}
			if no_create_new {
				candidate.dispose();
				return Ok(None);
			}

			let value = match (self.factory)(target, &candidate) {
				Ok(value) => Arc::new(value),
				Err(err) => {
					candidate.dispose();
					return Err(err);
				}
			};
			match self.publish(signature, candidate, value)? {
				Publish::Published(value) | Publish::Shared(value) => return Ok(Some(value)),
				Publish::Stale => continue,
			}
		}
	}

	/// Evicts every entry and refuses further lookups.
	pub fn dispose(&self) {
		dispose_entries(&self.entries);
	}

	fn lookup(&self, signature: &ScopeSignature) -> Result<Option<Arc<V>>> {
		let entries = self.entries.lock();
		if entries.disposed {
			return Err(Error::Disposed("scoped cache"));
		}
		Ok(entries
			.map
			.get(signature)
			.filter(|entry| entry.key.is_valid())
			.map(|entry| Arc::clone(&entry.value)))
	}

	fn publish(&self, signature: ScopeSignature, key: ScopeKey, value: Arc<V>) -> Result<Publish<V>> {
		let mut entries = self.entries.lock();
		if entries.disposed {
			drop(entries);
			key.dispose();
			value.evict();
			return Err(Error::Disposed("scoped cache"));
		}

		if let Some(existing) = entries.map.get(&signature)
			&& existing.key.is_valid()
		{
			let shared = Arc::clone(&existing.value);
			drop(entries);
			key.dispose();
			value.evict();
			return Ok(Publish::Shared(shared));
		}

		// A key already drained by an invalidating scope must not be published.
		if !key.is_valid() {
			drop(entries);
			value.evict();
			return Ok(Publish::Stale);
		}

		// Registering the eviction callback and inserting happen under the entries lock, so
		// an invalidation racing with publication always finds the entry to remove.
		let weak_entries = Arc::downgrade(&self.entries);
		let evict_key = key.clone();
		let evicted = Arc::clone(&value);
		let evict_signature = signature.clone();
		let registered = key.try_on_invalidate(move || {
			if let Some(entries) = weak_entries.upgrade() {
				let mut entries = entries.lock();
				if entries
					.map
					.get(&evict_signature)
					.is_some_and(|entry| entry.key.ptr_eq(&evict_key))
				{
					entries.map.remove(&evict_signature);
				}
			}
			tracing::debug!(key = %evict_key.id(), "scoped_cache.evict");
			evicted.evict();
		});
		if registered.is_err() {
			drop(entries);
			value.evict();
			return Ok(Publish::Stale);
		}

		tracing::debug!(key = %key.id(), scopes = signature.scopes().len(), "scoped_cache.publish");
		entries.map.insert(
			signature,
			CacheEntry {
				key,
				value: Arc::clone(&value),
			},
		);
		Ok(Publish::Published(value))
	}
}

/// Marks the cache disposed and disposes every published key; each key's eviction
/// callback then removes and evicts its own entry.
fn dispose_entries<V>(entries: &Mutex<Entries<V>>) {
	let keys: Vec<ScopeKey> = {
		let mut entries = entries.lock();
		if entries.disposed {
			return;
		}
		entries.disposed = true;
		entries.map.values().map(|entry| entry.key.clone()).collect()
	};
	tracing::debug!(entries = keys.len(), "scoped_cache.dispose");
	for key in keys {
		key.dispose();
	}
}

impl<T: ?Sized, V> Drop for ScopedCache<T, V> {
	fn drop(&mut self) {
		dispose_entries(&self.entries);
	}
}

enum Publish<V> {
	Published(Arc<V>),
	Shared(Arc<V>),
	/// The candidate was invalidated before it could be published.
	Stale,
}

impl<T: ?Sized, V> fmt::Debug for ScopedCache<T, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let entries = self.entries.lock();
		f.debug_struct("ScopedCache")
			.field("entries", &entries.map.len())
			.field("disposed", &entries.disposed)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests;
