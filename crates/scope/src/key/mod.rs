//! Scope keys: per-query records of scope membership.
//!
//! A [`ScopeKey`] records which [`Scope`]s a query currently belongs to and doubles as
//! the equality-based lookup key of a [`crate::ScopedCache`]. Membership is stored as an
//! index (`scope id -> weak scope`) mirrored by each scope's `key id -> weak key` table,
//! so neither side owns the other.
//!
//! # Locking
//!
//! Every key carries two locks:
//!
//! * the general `state` lock, guarding membership, auxiliary data, owned objects and
//!   callbacks;
//! * the narrow `validity` lock, held only for flag-level reads and writes and never while
//!   running callbacks, processor code or destructors.
//!
//! Lock nesting is restricted to `key state -> scope state -> key validity`. Operations
//! touching two keys lock their state in ascending `(id, address)` order. Arcs to scopes
//! upgraded under a key lock are dropped only after that lock is released, since dropping
//! the last handle of a scope re-enters its member keys.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::context::ScopeContext;
use crate::scope::{ScopeId, ScopeShared};
use crate::{Error, Result, Scope};

/// Type-erased auxiliary value shared between scopes and keys.
pub type AuxValue = Arc<dyn Any + Send + Sync>;

type InvalidationCallback = Box<dyn FnOnce() + Send>;
type RegistrarListener = Arc<dyn Fn() + Send + Sync>;

/// Identity of a key within its [`ScopeContext`]. Only used for lock ordering and indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub(crate) u64);

impl fmt::Display for KeyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "k{}", self.0)
	}
}

/// Validity state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validity {
	/// Registered scopes are all live.
	Valid,
	/// A scope invalidation detached this key and is finishing it.
	Invalidating,
	/// Invalidated. Stays invalid until [`ScopeKey::reset`].
	Invalid,
}

/// Construction-time policy of a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
	/// Treat [`Scope::invalidate_registrars`] like [`Scope::invalidate`].
	pub invalidate_on_registrar_change: bool,
	/// Dispose the key itself once it is invalidated.
	pub owns_self: bool,
}

impl KeyOptions {
	pub const fn new() -> Self {
		Self {
			invalidate_on_registrar_change: false,
			owns_self: false,
		}
	}

	pub const fn invalidate_on_registrar_change(mut self, enabled: bool) -> Self {
		self.invalidate_on_registrar_change = enabled;
		self
	}

	pub const fn owns_self(mut self, enabled: bool) -> Self {
		self.owns_self = enabled;
		self
	}
}

/// Immutable snapshot of a key's non-transparent membership.
///
/// This is the published form of a key: caches index entries by signature so that a
/// key's later mutation can never corrupt a live map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSignature {
	hash: u64,
	scopes: Vec<ScopeId>,
}

impl ScopeSignature {
	/// Sorted ids of the non-transparent scopes.
	pub fn scopes(&self) -> &[ScopeId] {
		&self.scopes
	}

	pub fn is_empty(&self) -> bool {
		self.scopes.is_empty()
	}
}

impl Hash for ScopeSignature {
	fn hash<H: Hasher>(&self, state: &mut H) {
		state.write_u64(self.hash);
	}
}

pub(crate) struct Membership {
	scope: Weak<ScopeShared>,
	transparent: bool,
}

pub(crate) struct KeyState {
	scopes: FxHashMap<ScopeId, Membership>,
	/// XOR of the mixed ids of all non-transparent scopes.
	hash: u64,
	aux: FxHashMap<String, AuxValue>,
	owned: Vec<Box<dyn Send>>,
	on_invalidate: Vec<InvalidationCallback>,
	on_registrars: Vec<RegistrarListener>,
	invalidated: bool,
	disposed: bool,
}

impl KeyState {
	fn new() -> Self {
		Self {
			scopes: FxHashMap::default(),
			hash: 0,
			aux: FxHashMap::default(),
			owned: Vec::new(),
			on_invalidate: Vec::new(),
			on_registrars: Vec::new(),
			invalidated: false,
			disposed: false,
		}
	}

	/// First write wins; conflicting writes are logged and dropped.
	fn merge_aux(&mut self, key: KeyId, name: &str, value: &AuxValue) -> bool {
		match self.aux.get(name) {
			Some(existing) if Arc::ptr_eq(existing, value) => true,
			Some(_) => {
				tracing::warn!(key = %key, aux = name, "scope_key.aux_conflict");
				false
			}
			None => {
				self.aux.insert(name.to_owned(), Arc::clone(value));
				true
			}
		}
	}

	fn same_membership(&self, other: &KeyState) -> bool {
		if self.hash != other.hash {
			return false;
		}
		let opaque = |state: &KeyState| state.scopes.values().filter(|m| !m.transparent).count();
		opaque(self) == opaque(other)
			&& self
				.scopes
				.iter()
				.filter(|(_, m)| !m.transparent)
				.all(|(id, _)| other.scopes.get(id).is_some_and(|m| !m.transparent))
	}
}

pub(crate) struct KeyShared {
	pub(crate) id: KeyId,
	context: ScopeContext,
	options: KeyOptions,
	pub(crate) state: Mutex<KeyState>,
	validity: Mutex<Validity>,
}

impl KeyShared {
	fn order(&self) -> (KeyId, usize) {
		(self.id, self as *const Self as usize)
	}

	fn validity(&self) -> Validity {
		*self.validity.lock()
	}

	fn lock_state(&self) -> MutexGuard<'_, KeyState> {
		self.state.lock()
	}

	/// Marks the key as invalidating. Called under a scope lock, so only the narrow lock is taken.
	pub(crate) fn begin_invalidate(&self) {
		let mut validity = self.validity.lock();
		if *validity == Validity::Valid {
			*validity = Validity::Invalidating;
		}
	}

	/// Adds `scope` to this key's membership. The caller holds `state`.
	pub(crate) fn attach(self: &Arc<Self>, state: &mut KeyState, scope: &Arc<ScopeShared>) -> Result<()> {
		if state.disposed {
			return Err(Error::Disposed("scope key"));
		}
		if state.invalidated {
			return Err(Error::InvalidKey);
		}
		if !self.context.same_as(&scope.context) {
			return Err(Error::KeyMismatch);
		}

		let mut scope_state = scope.state.lock();
		if scope_state.closed {
			return Err(Error::Disposed("scope"));
		}
		if self.validity() != Validity::Valid {
			return Err(Error::InvalidKey);
		}
		if state.scopes.contains_key(&scope.id) {
			return Ok(());
		}

		scope_state.keys.insert(self.id, Arc::downgrade(self));
		state.scopes.insert(
			scope.id,
			Membership {
				scope: Arc::downgrade(scope),
				transparent: scope.transparent,
			},
		);
		if !scope.transparent {
			state.hash ^= scope.id.mix();
		}
		if let Some(aux) = &scope.aux {
			state.merge_aux(self.id, &aux.name, &aux.value);
		}
		Ok(())
	}

	/// Removes this key from every scope it belongs to. The caller holds `state` and must
	/// drop the returned scopes only after releasing it.
	#[must_use]
	fn detach_all(&self, state: &mut KeyState) -> Vec<Arc<ScopeShared>> {
		let mut detached = Vec::with_capacity(state.scopes.len());
		for (_, membership) in state.scopes.drain() {
			if let Some(scope) = membership.scope.upgrade() {
				scope.state.lock().keys.remove(&self.id);
				detached.push(scope);
			}
		}
		state.hash = 0;
		detached
	}

	/// Completes invalidation. Idempotent; only the first caller fires callbacks.
	pub(crate) fn finish_invalidate(&self) {
		let (callbacks, owned, detached) = {
			let mut state = self.lock_state();
			if state.invalidated {
				return;
			}
			state.invalidated = true;
			self.begin_invalidate();
			let detached = self.detach_all(&mut state);
			*self.validity.lock() = Validity::Invalid;
			if self.options.owns_self {
				state.disposed = true;
			}
			state.on_registrars.clear();
			(mem::take(&mut state.on_invalidate), mem::take(&mut state.owned), detached)
		};
		drop(detached);

		tracing::trace!(key = %self.id, callbacks = callbacks.len(), owned = owned.len(), "scope_key.invalidated");
		for callback in callbacks {
			callback();
		}
		drop(owned);
	}
}

impl Drop for KeyShared {
	fn drop(&mut self) {
		let id = self.id;
		let state = self.state.get_mut();
		let mut detached = Vec::with_capacity(state.scopes.len());
		for (_, membership) in state.scopes.drain() {
			if let Some(scope) = membership.scope.upgrade() {
				scope.state.lock().keys.remove(&id);
				detached.push(scope);
			}
		}
		let callbacks = mem::take(&mut state.on_invalidate);
		drop(detached);
		for callback in callbacks {
			callback();
		}
	}
}

/// Locks two distinct keys in ascending order, returning the guards in argument order.
fn lock_pair<'a>(a: &'a KeyShared, b: &'a KeyShared) -> (MutexGuard<'a, KeyState>, MutexGuard<'a, KeyState>) {
	if a.order() < b.order() {
		let ga = a.lock_state();
		let gb = b.lock_state();
		(ga, gb)
	} else {
		let gb = b.lock_state();
		let ga = a.lock_state();
		(ga, gb)
	}
}

/// Handle to a scope key. Clones share the same key.
///
/// Two keys are equal iff both are in the same coarse validity class (valid or not) and
/// have identical non-transparent scope membership. Registration order and transparent
/// scopes never affect equality or hashing.
#[derive(Clone)]
pub struct ScopeKey {
	shared: Arc<KeyShared>,
}

impl ScopeKey {
	pub(crate) fn new(context: ScopeContext, id: KeyId, options: KeyOptions) -> Self {
		Self {
			shared: Arc::new(KeyShared {
				id,
				context,
				options,
				state: Mutex::new(KeyState::new()),
				validity: Mutex::new(Validity::Valid),
			}),
		}
	}

	pub(crate) fn from_shared(shared: Arc<KeyShared>) -> Self {
		Self { shared }
	}

	pub(crate) fn shared(&self) -> &Arc<KeyShared> {
		&self.shared
	}

	pub fn id(&self) -> KeyId {
		self.shared.id
	}

	pub fn context(&self) -> &ScopeContext {
		&self.shared.context
	}

	pub fn options(&self) -> KeyOptions {
		self.shared.options
	}

	pub fn validity(&self) -> Validity {
		self.shared.validity()
	}

	pub fn is_valid(&self) -> bool {
		self.validity() == Validity::Valid
	}

	pub fn is_disposed(&self) -> bool {
		self.shared.lock_state().disposed
	}

	/// Returns true when both handles refer to the same key.
	pub fn ptr_eq(&self, other: &ScopeKey) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}

	/// Registers this key on `scope`. Equivalent to [`Scope::register_key`].
	pub fn register_scope(&self, scope: &Scope) -> Result<()> {
		scope.register_key(self)
	}

	/// Returns true when this key is currently registered on `scope`.
	pub fn contains(&self, scope: &Scope) -> bool {
		self.shared.lock_state().scopes.contains_key(&scope.id())
	}

	/// Number of registered scopes, transparent ones included.
	pub fn scope_count(&self) -> usize {
		self.shared.lock_state().scopes.len()
	}

	/// Live registered scopes, transparent ones included, in unspecified order.
	pub fn scopes(&self) -> Vec<Scope> {
		let state = self.shared.lock_state();
		let scopes: Vec<Arc<ScopeShared>> = state.scopes.values().filter_map(|m| m.scope.upgrade()).collect();
		drop(state);
		scopes.into_iter().map(Scope::from_shared).collect()
	}

	/// Sorted names of registered named scopes. Anonymous scopes are omitted.
	pub fn scope_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.scopes().iter().filter_map(|scope| scope.name().map(str::to_owned)).collect();
		names.sort();
		names
	}

	/// Snapshot of the non-transparent membership.
	pub fn signature(&self) -> ScopeSignature {
		let state = self.shared.lock_state();
		let mut scopes: Vec<ScopeId> = state.scopes.iter().filter(|(_, m)| !m.transparent).map(|(id, _)| *id).collect();
		scopes.sort_unstable();
		ScopeSignature { hash: state.hash, scopes }
	}

	/// Returns the auxiliary value stored under `name`, if it has type `T`.
	pub fn aux<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
		let value = self.shared.lock_state().aux.get(name).cloned()?;
		value.downcast::<T>().ok()
	}

	/// Stores an auxiliary value. Returns false if `name` was already taken.
	pub fn insert_aux<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) -> bool {
		let name = name.into();
		let value: AuxValue = Arc::new(value);
		self.shared.lock_state().merge_aux(self.shared.id, &name, &value)
	}

	/// Detaches the key from all scopes, flips it to [`Validity::Invalid`], fires the
	/// invalidation callbacks and drops every owned object. No-op if already invalid.
	pub fn invalidate(&self) {
		self.shared.begin_invalidate();
		self.shared.finish_invalidate();
	}

	/// Notifies registrar listeners that membership may have changed.
	///
	/// Keys built with [`KeyOptions::invalidate_on_registrar_change`] are invalidated as well.
	pub fn invalidate_registrars(&self) {
		let listeners = {
			let state = self.shared.lock_state();
			if state.invalidated {
				return;
			}
			state.on_registrars.clone()
		};
		for listener in listeners {
			listener();
		}
		if self.shared.options.invalidate_on_registrar_change {
			self.invalidate();
		}
	}

	/// Invalidates the key and closes it permanently.
	pub fn dispose(&self) {
		self.invalidate();
		self.shared.lock_state().disposed = true;
	}

	/// Returns the key to a fresh, valid, empty state.
	///
	/// Owned objects are dropped and pending invalidation callbacks fire, since the scope
	/// configuration they were bound to no longer exists. Must not be called on a key that
	/// is published inside a cache.
	///
	/// # Errors
	///
	/// Returns [`Error::Disposed`] if the key was disposed.
	pub fn reset(&self) -> Result<()> {
		let (callbacks, owned, detached) = {
			let mut state = self.shared.lock_state();
			if state.disposed {
				return Err(Error::Disposed("scope key"));
			}
			let detached = self.shared.detach_all(&mut state);
			reset_state(&self.shared, &mut state);
			(mem::take(&mut state.on_invalidate), mem::take(&mut state.owned), detached)
		};
		drop(detached);
		for callback in callbacks {
			callback();
		}
		drop(owned);
		Ok(())
	}

	/// Ties `obj`'s lifetime to this key: it is dropped on invalidation or reset.
	///
	/// If the key is already invalid, `obj` is dropped immediately.
	pub fn take_ownership<O: Send + 'static>(&self, obj: O) {
		let mut state = self.shared.lock_state();
		if state.invalidated || state.disposed {
			drop(state);
			drop(obj);
			return;
		}
		state.owned.push(Box::new(obj));
	}

	/// Runs `callback` once when the key is invalidated, reset or dropped.
	///
	/// Runs it immediately if the key is already invalid.
	pub fn on_invalidate(&self, callback: impl FnOnce() + Send + 'static) {
		if let Err(callback) = self.try_on_invalidate(callback) {
			callback();
		}
	}

	/// Registers `callback` unless the key is already invalid, in which case it is handed back.
	pub(crate) fn try_on_invalidate<F>(&self, callback: F) -> std::result::Result<(), F>
	where
		F: FnOnce() + Send + 'static,
	{
		let mut state = self.shared.lock_state();
		if state.invalidated {
			return Err(callback);
		}
		state.on_invalidate.push(Box::new(callback));
		Ok(())
	}

	/// Runs `listener` every time a registered scope signals a registrar change.
	pub fn on_registrars_invalidated(&self, listener: impl Fn() + Send + Sync + 'static) {
		let mut state = self.shared.lock_state();
		if !state.invalidated {
			state.on_registrars.push(Arc::new(listener));
		}
	}

	/// Replaces `dst`'s membership with a copy of this key's membership and auxiliary data.
	///
	/// If this key is invalid (or loses a scope mid-copy), `dst` is invalidated too.
	pub fn copy_to(&self, dst: &ScopeKey) -> Result<()> {
		self.transfer(dst, true)
	}

	/// Registers `dst` on every scope this key belongs to, so invalidating any of them also
	/// invalidates `dst`. Propagates invalidity if this key is already invalid.
	pub fn forward_to(&self, dst: &ScopeKey) -> Result<()> {
		self.transfer(dst, false)
	}

	fn transfer(&self, dst: &ScopeKey, replace: bool) -> Result<()> {
		if self.ptr_eq(dst) {
			return Ok(());
		}
		if !self.context().same_as(dst.context()) {
			return Err(Error::KeyMismatch);
		}

		let mut deferred = Vec::new();
		let mut released = None;
		let invalidate_dst = {
			let (src, mut target) = lock_pair(&self.shared, &dst.shared);
			if target.disposed {
				return Err(Error::Disposed("scope key"));
			}
			if replace {
				deferred.extend(dst.shared.detach_all(&mut target));
				reset_state(&dst.shared, &mut target);
				released = Some((mem::take(&mut target.on_invalidate), mem::take(&mut target.owned)));
			} else if target.invalidated || dst.validity() != Validity::Valid {
				return Ok(());
			}

			let mut lost = src.invalidated || self.validity() != Validity::Valid;
			if !lost {
				for membership in src.scopes.values() {
					let Some(scope) = membership.scope.upgrade() else {
						lost = true;
						break;
					};
					let attached = dst.shared.attach(&mut target, &scope);
					deferred.push(scope);
					if attached.is_err() {
						// Either dst is being invalidated or the scope was closed under us,
						// in which case this key is about to be invalidated too.
						lost = true;
						break;
					}
				}
				for (name, value) in &src.aux {
					target.merge_aux(dst.shared.id, name, value);
				}
			}
			lost
		};
		drop(deferred);

		if let Some((callbacks, owned)) = released {
			for callback in callbacks {
				callback();
			}
			drop(owned);
		}
		if invalidate_dst {
			dst.invalidate();
		}
		Ok(())
	}
}

/// Clears everything but owned objects and callbacks, which the caller takes.
fn reset_state(shared: &KeyShared, state: &mut KeyState) {
	state.aux.clear();
	state.on_registrars.clear();
	state.invalidated = false;
	*shared.validity.lock() = Validity::Valid;
}

impl PartialEq for ScopeKey {
	fn eq(&self, other: &Self) -> bool {
		if self.ptr_eq(other) {
			return true;
		}
		let (a, b) = lock_pair(&self.shared, &other.shared);
		let valid_a = self.shared.validity() == Validity::Valid;
		let valid_b = other.shared.validity() == Validity::Valid;
		valid_a == valid_b && a.same_membership(&b)
	}
}

impl Eq for ScopeKey {}

impl Hash for ScopeKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		state.write_u64(self.shared.lock_state().hash);
	}
}

impl fmt::Debug for ScopeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScopeKey")
			.field("id", &self.id())
			.field("validity", &self.validity())
			.field("scopes", &self.scope_names())
			.finish()
	}
}
