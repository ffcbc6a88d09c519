use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::*;
use crate::Scope;

/// Value recording how often it was evicted.
struct Tracked {
	generation: usize,
	evictions: Arc<AtomicUsize>,
}

impl ScopedValue for Tracked {
	fn evict(&self) {
		self.evictions.fetch_add(1, Ordering::SeqCst);
	}
}

/// Target whose scopes are configurable from the test.
struct Sprite {
	scopes: Vec<Scope>,
}

impl ScopedTarget for Sprite {
	fn register_scopes(&self, key: &ScopeKey) -> Result<bool> {
		if self.scopes.is_empty() {
			return Ok(false);
		}
		for scope in &self.scopes {
			scope.register_key(key)?;
		}
		Ok(true)
	}
}

struct Harness {
	ctx: ScopeContext,
	cache: ScopedCache<Sprite, Tracked>,
	created: Arc<AtomicUsize>,
	evictions: Arc<AtomicUsize>,
}

fn harness() -> Harness {
	let ctx = ScopeContext::new();
	let created = Arc::new(AtomicUsize::new(0));
	let evictions = Arc::new(AtomicUsize::new(0));
	let (c, e) = (Arc::clone(&created), Arc::clone(&evictions));
	let cache = ScopedCache::self_registering(&ctx, move |_: &Sprite, _: &ScopeKey| {
		Ok(Tracked {
			generation: c.fetch_add(1, Ordering::SeqCst),
			evictions: Arc::clone(&e),
		})
	});
	Harness {
		ctx,
		cache,
		created,
		evictions,
	}
}

#[test]
fn targets_with_equal_scopes_share_a_value() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let b = h.ctx.named_scope("b");

	let first = h.cache.get(&Sprite { scopes: vec![a.clone(), b.clone()] }).unwrap().unwrap();
	let second = h.cache.get(&Sprite { scopes: vec![b.clone(), a.clone()] }).unwrap().unwrap();
	let other = h.cache.get(&Sprite { scopes: vec![a.clone()] }).unwrap().unwrap();

	assert!(Arc::ptr_eq(&first, &second));
	assert!(!Arc::ptr_eq(&first, &other));
	assert_eq!(h.created.load(Ordering::SeqCst), 2);
	assert_eq!(h.cache.len(), 2);
}

#[test]
fn transparent_scopes_do_not_split_entries() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let hidden = h.ctx.scope_builder().transparent(true).build();

	let plain = h.cache.get(&Sprite { scopes: vec![a.clone()] }).unwrap().unwrap();
	let with_hidden = h.cache.get(&Sprite { scopes: vec![a.clone(), hidden.clone()] }).unwrap().unwrap();
	assert!(Arc::ptr_eq(&plain, &with_hidden));
}

#[test]
fn invalidation_evicts_exactly_once() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let sprite = Sprite { scopes: vec![a.clone()] };

	let first = h.cache.get(&sprite).unwrap().unwrap();
	assert_eq!(first.generation, 0);

	a.invalidate();
	assert!(h.cache.is_empty());
	assert_eq!(h.evictions.load(Ordering::SeqCst), 1);

	a.invalidate();
	assert_eq!(h.evictions.load(Ordering::SeqCst), 1);

	let second = h.cache.get(&sprite).unwrap().unwrap();
	assert_eq!(second.generation, 1);
	assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn untouched_configurations_survive_invalidation() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let b = h.ctx.named_scope("b");

	let only_b = h.cache.get(&Sprite { scopes: vec![b.clone()] }).unwrap().unwrap();
	h.cache.get(&Sprite { scopes: vec![a.clone()] }).unwrap();
	a.invalidate();

	assert_eq!(h.cache.len(), 1);
	let again = h.cache.get(&Sprite { scopes: vec![b.clone()] }).unwrap().unwrap();
	assert!(Arc::ptr_eq(&only_b, &again));
}

#[test]
fn targets_without_scoped_data_yield_none() {
	let h = harness();
	assert!(h.cache.get(&Sprite { scopes: Vec::new() }).unwrap().is_none());
	assert_eq!(h.created.load(Ordering::SeqCst), 0);
}

#[test]
fn no_create_new_only_reads() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let sprite = Sprite { scopes: vec![a.clone()] };

	assert!(h.cache.get_scoped_data(&sprite, None, true).unwrap().is_none());
	assert_eq!(a.key_count(), 0);

	let created = h.cache.get(&sprite).unwrap().unwrap();
	let read = h.cache.get_scoped_data(&sprite, None, true).unwrap().unwrap();
	assert!(Arc::ptr_eq(&created, &read));
}

#[test]
fn caller_key_is_chained() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	let caller = h.ctx.new_key();

	h.cache.get_scoped_data(&Sprite { scopes: vec![a.clone()] }, Some(&caller), false).unwrap();
	assert!(caller.contains(&a));

	a.invalidate();
	assert!(!caller.is_valid());
}

#[test]
fn caller_key_from_another_context_is_rejected() {
	let h = harness();
	let foreign = ScopeContext::new().new_key();
	let result = h.cache.get_scoped_data(&Sprite { scopes: Vec::new() }, Some(&foreign), false);
	assert!(matches!(result, Err(Error::KeyMismatch)));
}

#[test]
fn disposed_cache_evicts_and_rejects() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	h.cache.get(&Sprite { scopes: vec![a.clone()] }).unwrap();

	h.cache.dispose();
	assert!(h.cache.is_disposed());
	assert!(h.cache.is_empty());
	assert_eq!(h.evictions.load(Ordering::SeqCst), 1);
	assert!(matches!(h.cache.get(&Sprite { scopes: vec![a.clone()] }), Err(Error::Disposed(_))));

	a.invalidate();
	assert_eq!(h.evictions.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_cache_evicts_entries() {
	let h = harness();
	let a = h.ctx.named_scope("a");
	h.cache.get(&Sprite { scopes: vec![a.clone()] }).unwrap();
	let evictions = Arc::clone(&h.evictions);

	drop(h);
	assert_eq!(evictions.load(Ordering::SeqCst), 1);
	assert_eq!(a.key_count(), 0);
}

#[test]
fn failed_computations_are_not_cached() {
	let ctx = ScopeContext::new();
	let a = ctx.named_scope("a");
	let attempts = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&attempts);
	let registrar_scope = a.clone();
	let cache: ScopedCache<str, Tracked> = ScopedCache::new(
		&ctx,
		move |_: &str, key: &ScopeKey| registrar_scope.register_key(key).map(|()| true),
		move |_: &str, _: &ScopeKey| {
			if counter.fetch_add(1, Ordering::SeqCst) == 0 {
				return Err(Error::processor(std::io::Error::other("decode failed")));
			}
			Ok(Tracked {
				generation: 1,
				evictions: Arc::new(AtomicUsize::new(0)),
			})
		},
	);

	assert!(matches!(cache.get("hair"), Err(Error::Processor(_))));
	assert!(cache.is_empty());
	assert_eq!(a.key_count(), 0);
	assert_eq!(cache.get("hair").unwrap().unwrap().generation, 1);
	assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn registration_racing_with_invalidation_retries() {
	let ctx = ScopeContext::new();
	let a = ctx.named_scope("a");
	let passes = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&passes);
	let registrar_scope = a.clone();
	let cache: ScopedCache<str, Tracked> = ScopedCache::new(
		&ctx,
		move |_: &str, key: &ScopeKey| -> Result<bool> {
			registrar_scope.register_key(key)?;
			// Simulate a concurrent invalidation landing mid-registration on the first pass.
			if counter.fetch_add(1, Ordering::SeqCst) == 0 {
				registrar_scope.invalidate();
			}
			Ok(true)
		},
		|_: &str, _: &ScopeKey| {
			Ok(Tracked {
				generation: 0,
				evictions: Arc::new(AtomicUsize::new(0)),
			})
		},
	);

	assert!(cache.get("hair").unwrap().is_some());
	assert_eq!(passes.load(Ordering::SeqCst), 2);
	assert_eq!(cache.len(), 1);
}

#[test]
fn registration_losing_every_scope_retries_and_chains_the_caller() {
	let ctx = ScopeContext::new();
	let a = ctx.named_scope("a");
	let passes = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&passes);
	let registrar_scope = a.clone();
	let cache: ScopedCache<str, Tracked> = ScopedCache::new(
		&ctx,
		move |_: &str, key: &ScopeKey| -> Result<bool> {
			registrar_scope.register_key(key)?;
			if counter.fetch_add(1, Ordering::SeqCst) == 0 {
				registrar_scope.invalidate();
			}
			Ok(key.scope_count() > 0)
		},
		|_: &str, _: &ScopeKey| {
			Ok(Tracked {
				generation: 0,
				evictions: Arc::new(AtomicUsize::new(0)),
			})
		},
	);
	let caller = ctx.new_key();

	assert!(cache.get_scoped_data("hair", Some(&caller), false).unwrap().is_some());
	assert_eq!(passes.load(Ordering::SeqCst), 2);
	assert!(caller.is_valid());
	assert!(caller.contains(&a));
	assert_eq!(cache.len(), 1);
}

#[test]
fn invalidating_candidates_are_never_published() {
	let ctx = ScopeContext::new();
	let a = ctx.named_scope("a");
	let builds = Arc::new(AtomicUsize::new(0));
	let evictions = Arc::new(AtomicUsize::new(0));
	let (counter, evicted) = (Arc::clone(&builds), Arc::clone(&evictions));
	let registrar_scope = a.clone();
	let cache: ScopedCache<str, Tracked> = ScopedCache::new(
		&ctx,
		move |_: &str, key: &ScopeKey| registrar_scope.register_key(key).map(|()| true),
		move |_: &str, key: &ScopeKey| {
			let generation = counter.fetch_add(1, Ordering::SeqCst);
			// The first candidate is drained by a scope whose invalidation has not finished.
			if generation == 0 {
				key.shared().begin_invalidate();
			}
			Ok(Tracked {
				generation,
				evictions: Arc::clone(&evicted),
			})
		},
	);

	let value = cache.get("hair").unwrap().unwrap();
	assert_eq!(value.generation, 1);
	assert_eq!(builds.load(Ordering::SeqCst), 2);
	assert_eq!(evictions.load(Ordering::SeqCst), 1);
	assert_eq!(cache.len(), 1);
	assert!(cache.entries.lock().map.values().all(|entry| entry.key.is_valid()));
}

#[test]
fn registrar_errors_surface_when_candidate_is_valid() {
	let ctx = ScopeContext::new();
	let closed = ctx.named_scope("closed");
	closed.dispose();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let log = Arc::clone(&seen);
	let registrar_scope = closed.clone();
	let cache: ScopedCache<str, Tracked> = ScopedCache::new(
		&ctx,
		move |target: &str, key: &ScopeKey| {
			log.lock().push(target.to_owned());
			registrar_scope.register_key(key).map(|()| true)
		},
		|_: &str, _: &ScopeKey| unreachable!("registration never succeeds"),
	);

	assert!(matches!(cache.get("hair"), Err(Error::Disposed("scope"))));
	assert_eq!(seen.lock().as_slice(), ["hair".to_string()]);
}
