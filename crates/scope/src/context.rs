use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::ContextConfig;
use crate::key::{KeyId, KeyOptions, ScopeKey};
use crate::scope::{ScopeBuilder, ScopeId, ScopeShared};
use crate::Scope;

/// Snapshot of one live named scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
	pub name: String,
	pub transparent: bool,
	pub key_count: usize,
}

struct ContextInner {
	config: ContextConfig,
	next_scope: AtomicU64,
	next_key: AtomicU64,
	named: Mutex<Vec<Weak<ScopeShared>>>,
}

/// Owner of id allocation and debug bookkeeping for one family of scopes and keys.
///
/// Whatever composes the system creates a context and hands it to every cache and
/// processor that needs to build scopes or keys. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct ScopeContext {
	inner: Arc<ContextInner>,
}

impl Default for ScopeContext {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for ScopeContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScopeContext")
			.field("config", &self.inner.config)
			.field("scopes", &self.inner.next_scope.load(Ordering::Relaxed))
			.field("keys", &self.inner.next_key.load(Ordering::Relaxed))
			.finish()
	}
}

impl ScopeContext {
	/// Creates a context with the default configuration.
	pub fn new() -> Self {
		Self::with_config(ContextConfig::default())
	}

	/// Creates a context with an explicit configuration.
	pub fn with_config(config: ContextConfig) -> Self {
		Self {
			inner: Arc::new(ContextInner {
				config,
				next_scope: AtomicU64::new(0),
				next_key: AtomicU64::new(0),
				named: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn config(&self) -> &ContextConfig {
		&self.inner.config
	}

	/// Returns true when both handles refer to the same context.
	pub fn same_as(&self, other: &ScopeContext) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	/// Starts building a scope owned by this context.
	pub fn scope_builder(&self) -> ScopeBuilder {
		ScopeBuilder::new(self.clone())
	}

	/// Creates a named, non-transparent scope.
	pub fn named_scope(&self, name: impl Into<String>) -> Scope {
		self.scope_builder().name(name).build()
	}

	/// Creates an anonymous, non-transparent scope.
	pub fn anonymous_scope(&self) -> Scope {
		self.scope_builder().build()
	}

	/// Creates a fresh, valid key with default options.
	pub fn new_key(&self) -> ScopeKey {
		self.key_with(KeyOptions::default())
	}

	/// Creates a fresh, valid key with explicit options.
	pub fn key_with(&self, options: KeyOptions) -> ScopeKey {
		ScopeKey::new(self.clone(), self.next_key_id(), options)
	}

	/// Lists live named scopes sorted by name. Anonymous scopes never appear.
	pub fn named_scopes(&self) -> Vec<ScopeInfo> {
		let mut named = self.inner.named.lock();
		named.retain(|weak| weak.strong_count() > 0);
		let live: Vec<Arc<ScopeShared>> = named.iter().filter_map(Weak::upgrade).collect();
		drop(named);

		let mut infos: Vec<ScopeInfo> = live
			.into_iter()
			.map(Scope::from_shared)
			.filter_map(|scope| {
				Some(ScopeInfo {
					name: scope.name()?.to_owned(),
					transparent: scope.is_transparent(),
					key_count: scope.key_count(),
				})
			})
			.collect();
		infos.sort_by(|a, b| a.name.cmp(&b.name));
		infos
	}

	pub(crate) fn next_scope_id(&self) -> ScopeId {
		ScopeId(self.inner.next_scope.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
	}

	pub(crate) fn next_key_id(&self) -> KeyId {
		KeyId(self.inner.next_key.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
	}

	pub(crate) fn track_named(&self, scope: &Arc<ScopeShared>) {
		if !self.inner.config.track_named_scopes {
			return;
		}
		let mut named = self.inner.named.lock();
		// Prune dead entries before the vector grows, keeping pushes amortized O(1).
		if named.len() == named.capacity() {
			named.retain(|weak| weak.strong_count() > 0);
		}
		named.push(Arc::downgrade(scope));
	}
}
