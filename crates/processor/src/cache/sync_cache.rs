use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_scope::{Result, ScopeContext, ScopeKey, ScopedCache, ScopedValue};

use crate::processor::{DataProcessor, Processed, SharedProcessor};

/// Inner table of one scope configuration.
struct SyncTable<I, D> {
	state: Mutex<TableState<I, D>>,
}

struct TableState<I, D> {
	results: FxHashMap<I, Processed<D>>,
	evicted: bool,
}

impl<I: Eq + Hash, D: Clone> SyncTable<I, D> {
	fn new() -> Self {
		Self {
			state: Mutex::new(TableState {
				results: FxHashMap::default(),
				evicted: false,
			}),
		}
	}

	fn get(&self, id: &I) -> Option<Processed<D>> {
		self.state.lock().results.get(id).cloned()
	}

	/// Stores a result unless the table was evicted while it was computed.
	fn insert(&self, id: I, result: Processed<D>) -> bool {
		let mut state = self.state.lock();
		if state.evicted {
			return false;
		}
		state.results.insert(id, result);
		true
	}
}

impl<I, D> ScopedValue for SyncTable<I, D>
where
	I: Send + Sync + 'static,
	D: Send + Sync + 'static,
{
	fn evict(&self) {
		let mut state = self.state.lock();
		state.evicted = true;
		state.results.clear();
	}
}

/// Memoizes a sync processor per scope configuration and identifier.
///
/// The cache is itself a [`DataProcessor`]: registering scopes through it registers the
/// inner processor's scopes, and the key passed to [`process_data`](DataProcessor::process_data)
/// is chained onto the configuration it was served from.
pub struct DataProcessorCache<T: ?Sized, I, D> {
	processor: SharedProcessor<T, I, D>,
	tables: ScopedCache<T, SyncTable<I, D>>,
}

impl<T, I, D> DataProcessorCache<T, I, D>
where
	T: ?Sized + 'static,
	I: Clone + Eq + Hash + Send + Sync + 'static,
	D: Clone + Send + Sync + 'static,
{
	pub fn new(context: &ScopeContext, processor: SharedProcessor<T, I, D>) -> Self {
		let registrar = Arc::clone(&processor);
		let tables = ScopedCache::new(
			context,
			move |target: &T, key: &ScopeKey| -> Result<bool> {
				registrar.register_scopes(target, key)?;
				Ok(key.scope_count() > 0)
			},
			|_: &T, _: &ScopeKey| Ok(SyncTable::new()),
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

	/// Drops every cached result and rejects further processing.
	pub fn dispose(&self) {
		self.tables.dispose();
	}
}

impl<T, I, D> DataProcessor<T, I, D> for DataProcessorCache<T, I, D>
where
	T: ?Sized + 'static,
	I: Clone + Eq + Hash + Send + Sync + 'static,
	D: Clone + Send + Sync + 'static,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		self.processor.register_scopes(target, key)
	}

	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool> {
		loop {
			let Some(table) = self.tables.get_scoped_data(target, Some(key), false)? else {
				return self.processor.process_data(target, key, id, data);
			};
			if let Some(hit) = table.get(id) {
				*data = hit.data;
				return Ok(hit.modified);
			}

			let mut output = data.clone();
			let modified = self.processor.process_data(target, key, id, &mut output)?;
			let result = Processed { modified, data: output };
			if table.insert(id.clone(), result.clone()) {
				*data = result.data;
				return Ok(modified);
			}
			tracing::debug!("processor_cache.retry");
		}
	}
}

impl<T: ?Sized, I, D> fmt::Debug for DataProcessorCache<T, I, D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DataProcessorCache").field("tables", &self.tables).finish_non_exhaustive()
	}
}
