//! Scopes: invalidation domains.
//!
//! A [`Scope`] stands for one dynamic condition (for example "the active level" or
//! "slot 3's processor"). Keys register on the scopes they depend on; invalidating a
//! scope invalidates every registered key without the scope knowing what the keys are
//! used for.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::context::ScopeContext;
use crate::key::{AuxValue, KeyId, KeyShared, ScopeKey};
use crate::Result;

/// Identity of a scope within its [`ScopeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) u64);

impl ScopeId {
	/// Spreads the id over 64 bits so XOR-combined key hashes stay well distributed.
	pub(crate) fn mix(self) -> u64 {
		let mut hasher = FxHasher::default();
		self.0.hash(&mut hasher);
		hasher.finish()
	}
}

impl fmt::Display for ScopeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "s{}", self.0)
	}
}

pub(crate) struct AuxEntry {
	pub(crate) name: String,
	pub(crate) value: AuxValue,
}

pub(crate) struct ScopeState {
	pub(crate) keys: FxHashMap<KeyId, Weak<KeyShared>>,
	pub(crate) closed: bool,
}

pub(crate) struct ScopeShared {
	pub(crate) id: ScopeId,
	pub(crate) context: ScopeContext,
	pub(crate) name: Option<String>,
	pub(crate) transparent: bool,
	pub(crate) aux: Option<AuxEntry>,
	pub(crate) state: Mutex<ScopeState>,
}

impl ScopeShared {
	fn label(&self) -> &str {
		self.name.as_deref().unwrap_or("<anonymous>")
	}

	/// Detaches every key under the scope lock, then finishes them outside of it.
	fn invalidate_keys(&self, close: bool) {
		let keys: Vec<Arc<KeyShared>> = {
			let mut state = self.state.lock();
			if close {
				state.closed = true;
			}
			state
				.keys
				.drain()
				.filter_map(|(_, key)| key.upgrade())
				.inspect(|key| key.begin_invalidate())
				.collect()
		};

		tracing::debug!(scope = self.label(), id = %self.id, keys = keys.len(), closed = close, "scope.invalidate");
		for key in keys {
			key.finish_invalidate();
		}
	}
}

impl Drop for ScopeShared {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		state.closed = true;
		let keys: Vec<Arc<KeyShared>> = state.keys.drain().filter_map(|(_, key)| key.upgrade()).collect();
		if keys.is_empty() {
			return;
		}

		tracing::debug!(scope = self.label(), id = %self.id, keys = keys.len(), "scope.dropped");
		for key in &keys {
			key.begin_invalidate();
		}
		for key in keys {
			key.finish_invalidate();
		}
	}
}

/// Handle to an invalidation domain. Clones share the same scope.
///
/// Dropping the last handle invalidates every key still registered on the scope.
#[derive(Clone)]
pub struct Scope {
	shared: Arc<ScopeShared>,
}

impl Scope {
	pub(crate) fn from_shared(shared: Arc<ScopeShared>) -> Self {
		Self { shared }
	}

	pub fn id(&self) -> ScopeId {
		self.shared.id
	}

	/// Scope name. `None` for anonymous scopes.
	pub fn name(&self) -> Option<&str> {
		self.shared.name.as_deref()
	}

	pub fn is_anonymous(&self) -> bool {
		self.shared.name.is_none()
	}

	/// Transparent scopes are tracked but never affect key equality or hashing.
	pub fn is_transparent(&self) -> bool {
		self.shared.transparent
	}

	pub fn context(&self) -> &ScopeContext {
		&self.shared.context
	}

	/// Returns true when both handles refer to the same scope.
	pub fn ptr_eq(&self, other: &Scope) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}

	pub fn is_disposed(&self) -> bool {
		self.shared.state.lock().closed
	}

	/// Number of currently registered keys.
	pub fn key_count(&self) -> usize {
		self.shared.state.lock().keys.len()
	}

	/// Registers `key` on this scope.
	///
	/// Must not be called while holding any scope's internal lock.
	///
	/// # Errors
	///
	/// * [`crate::Error::InvalidKey`] if the key is invalid or being invalidated.
	/// * [`crate::Error::Disposed`] if the key or this scope was disposed.
	/// * [`crate::Error::KeyMismatch`] if the key belongs to another context.
	pub fn register_key(&self, key: &ScopeKey) -> Result<()> {
		let shared = key.shared();
		let mut state = shared.state.lock();
		shared.attach(&mut state, &self.shared)
	}

	/// Invalidates every registered key. The scope itself stays usable.
	///
	/// Keys are detached and marked invalidating atomically under the scope lock, so a
	/// concurrent registration either lands before (and is invalidated here) or observes the
	/// key as invalid and fails. Calling this twice has the same effect as calling it once.
	pub fn invalidate(&self) {
		self.shared.invalidate_keys(false);
	}

	/// Signals that the set of scopes a target belongs to may have changed.
	///
	/// Weaker than [`Scope::invalidate`]: keys keep their membership unless they opted into
	/// [`crate::KeyOptions::invalidate_on_registrar_change`].
	pub fn invalidate_registrars(&self) {
		let keys: Vec<Arc<KeyShared>> = self.shared.state.lock().keys.values().filter_map(Weak::upgrade).collect();
		tracing::debug!(scope = self.shared.label(), id = %self.shared.id, keys = keys.len(), "scope.invalidate_registrars");
		for key in keys {
			ScopeKey::from_shared(key).invalidate_registrars();
		}
	}

	/// Invalidates every registered key and closes the scope; later registrations fail.
	pub fn dispose(&self) {
		self.shared.invalidate_keys(true);
	}
}

impl fmt::Debug for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Scope")
			.field("id", &self.shared.id)
			.field("name", &self.shared.name)
			.field("transparent", &self.shared.transparent)
			.finish_non_exhaustive()
	}
}

/// Builder for [`Scope`]s, obtained from [`ScopeContext::scope_builder`].
pub struct ScopeBuilder {
	context: ScopeContext,
	name: Option<String>,
	transparent: bool,
	aux: Option<AuxEntry>,
}

impl ScopeBuilder {
	pub(crate) fn new(context: ScopeContext) -> Self {
		Self {
			context,
			name: None,
			transparent: false,
			aux: None,
		}
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn transparent(mut self, transparent: bool) -> Self {
		self.transparent = transparent;
		self
	}

	/// Auxiliary entry copied into every key that registers on the scope.
	pub fn aux_entry<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
		self.aux = Some(AuxEntry {
			name: name.into(),
			value: Arc::new(value),
		});
		self
	}

	pub fn build(self) -> Scope {
		let shared = Arc::new(ScopeShared {
			id: self.context.next_scope_id(),
			context: self.context.clone(),
			name: self.name,
			transparent: self.transparent,
			aux: self.aux,
			state: Mutex::new(ScopeState {
				keys: FxHashMap::default(),
				closed: false,
			}),
		});
		if shared.name.is_some() {
			self.context.track_named(&shared);
		}
		Scope::from_shared(shared)
	}
}
