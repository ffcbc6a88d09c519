//! Ordered chains of processors.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tether_scope::{Result, Scope, ScopeContext, ScopeKey};
use tokio_util::sync::CancellationToken;

use crate::processor::{AsyncDataProcessor, DataProcessor, Processed};

enum ChildRef<P: ?Sized> {
	Strong(Arc<P>),
	Weak(Weak<P>),
}

struct Child<P: ?Sized> {
	priority: i32,
	seq: u64,
	processor: ChildRef<P>,
	removed: AtomicBool,
}

impl<P: ?Sized> Child<P> {
	fn live(&self) -> Option<Arc<P>> {
		if self.removed.load(Ordering::Acquire) {
			return None;
		}
		match &self.processor {
			ChildRef::Strong(processor) => Some(Arc::clone(processor)),
			ChildRef::Weak(processor) => processor.upgrade(),
		}
	}
}

struct CompositeInner<P: ?Sized> {
	scope: Scope,
	children: RwLock<Vec<Arc<Child<P>>>>,
	next_seq: AtomicU64,
}

impl<P: ?Sized> CompositeInner<P> {
	/// Live children in fold order. Compacts dead entries when any are seen.
	fn snapshot(&self) -> Vec<Arc<P>> {
		let (live, stale) = {
			let children = self.children.read();
			let live: Vec<_> = children.iter().filter_map(|child| child.live()).collect();
			let stale = live.len() != children.len();
			(live, stale)
		};
		if stale {
			self.compact();
		}
		live
	}

	fn compact(&self) {
		let mut children = self.children.write();
		let before = children.len();
		children.retain(|child| child.live().is_some());
		let dropped = before - children.len();
		if dropped > 0 {
			tracing::trace!(dropped, "composite.compact");
		}
	}
}

/// Ordered chain folding every live child over the same key and data.
///
/// Children run in ascending priority, ties in insertion order. Every child observes
/// every call; `modified` is OR-reduced without short-circuiting.
///
/// The composite registers its own anonymous scope on every key and invalidates it
/// whenever a child is added or removed, so cached chain results never outlive the chain
/// that produced them. Weak children dropping out on their own do not invalidate it.
pub struct CompositeProcessor<P: ?Sized> {
	inner: Arc<CompositeInner<P>>,
}

impl<P: ?Sized> CompositeProcessor<P> {
	pub fn new(context: &ScopeContext) -> Self {
		Self {
			inner: Arc::new(CompositeInner {
				scope: context.anonymous_scope(),
				children: RwLock::new(Vec::new()),
				next_seq: AtomicU64::new(0),
			}),
		}
	}

	/// Adds a child the composite keeps alive.
	pub fn add(&self, priority: i32, processor: Arc<P>) -> ChildHandle<P> {
		self.insert(priority, ChildRef::Strong(processor))
	}

	/// Adds a child that silently leaves the chain once its last strong handle drops.
	pub fn add_weak(&self, priority: i32, processor: &Arc<P>) -> ChildHandle<P> {
		self.insert(priority, ChildRef::Weak(Arc::downgrade(processor)))
	}

	/// Number of live children.
	pub fn len(&self) -> usize {
		self.inner.snapshot().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The scope invalidated whenever the chain changes.
	pub fn scope(&self) -> &Scope {
		&self.inner.scope
	}

	fn insert(&self, priority: i32, processor: ChildRef<P>) -> ChildHandle<P> {
		let child = Arc::new(Child {
			priority,
			seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
			processor,
			removed: AtomicBool::new(false),
		});
		{
			let mut children = self.inner.children.write();
			let at = children.partition_point(|c| (c.priority, c.seq) <= (child.priority, child.seq));
			children.insert(at, Arc::clone(&child));
		}
		tracing::debug!(priority, "composite.add");
		self.inner.scope.invalidate();
		ChildHandle {
			composite: Arc::downgrade(&self.inner),
			child: Arc::downgrade(&child),
		}
	}
}

/// Handle used to remove a child from its composite.
pub struct ChildHandle<P: ?Sized> {
	composite: Weak<CompositeInner<P>>,
	child: Weak<Child<P>>,
}

impl<P: ?Sized> ChildHandle<P> {
	/// Removes the child. Returns `false` if it was already removed or the composite is gone.
	pub fn remove(&self) -> bool {
		let Some(child) = self.child.upgrade() else {
			return false;
		};
		if child.removed.swap(true, Ordering::AcqRel) {
			return false;
		}
		drop(child);
		if let Some(composite) = self.composite.upgrade() {
			composite.compact();
			tracing::debug!("composite.remove");
			composite.scope.invalidate();
		}
		true
	}

	pub fn is_removed(&self) -> bool {
		self.child.upgrade().is_none_or(|child| child.removed.load(Ordering::Acquire))
	}
}

impl<P: ?Sized> fmt::Debug for ChildHandle<P> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChildHandle").field("removed", &self.is_removed()).finish()
	}
}

impl<T, I, D, P> DataProcessor<T, I, D> for CompositeProcessor<P>
where
	T: ?Sized,
	I: ?Sized,
	P: DataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		self.inner.scope.register_key(key)?;
		for child in self.inner.snapshot() {
			child.register_scopes(target, key)?;
		}
		Ok(())
	}

	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool> {
		let mut modified = false;
		for child in self.inner.snapshot() {
			modified |= child.process_data(target, key, id, data)?;
		}
		Ok(modified)
	}
}

#[async_trait]
impl<T, I, D, P> AsyncDataProcessor<T, I, D> for CompositeProcessor<P>
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
	P: AsyncDataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		self.inner.scope.register_key(key)?;
		for child in self.inner.snapshot() {
			child.register_scopes(target, key)?;
		}
		Ok(())
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		let mut folded = Processed::unchanged(data);
		for child in self.inner.snapshot() {
			if cancel.is_cancelled() {
				return Err(tether_scope::Error::Cancelled);
			}
			let step = child.process_data_async(target, key, id, folded.data, cancel).await?;
			folded = Processed {
				modified: folded.modified | step.modified,
				data: step.data,
			};
		}
		Ok(folded)
	}
}

impl<P: ?Sized> fmt::Debug for CompositeProcessor<P> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompositeProcessor")
			.field("scope", &self.inner.scope.id())
			.field("children", &self.inner.children.read().len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use parking_lot::Mutex;
	use pretty_assertions::assert_eq;

	use super::*;

	/// Appends its tag to the data and records every call.
	struct Tag {
		tag: &'static str,
		modifies: bool,
		registered: AtomicUsize,
		log: Arc<Mutex<Vec<&'static str>>>,
	}

	impl Tag {
		fn new(tag: &'static str, modifies: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn DataProcessor<str, u32, Vec<&'static str>>> {
			Arc::new(Self {
				tag,
				modifies,
				registered: AtomicUsize::new(0),
				log: Arc::clone(log),
			})
		}
	}

	impl DataProcessor<str, u32, Vec<&'static str>> for Tag {
		fn register_scopes(&self, _: &str, _: &ScopeKey) -> Result<()> {
			self.registered.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		fn process_data(&self, _: &str, _: &ScopeKey, _: &u32, data: &mut Vec<&'static str>) -> Result<bool> {
			self.log.lock().push(self.tag);
			if self.modifies {
				data.push(self.tag);
			}
			Ok(self.modifies)
		}
	}

	type Chain = CompositeProcessor<dyn DataProcessor<str, u32, Vec<&'static str>>>;

	#[test]
	fn children_run_by_priority_then_insertion() {
		let ctx = ScopeContext::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = Chain::new(&ctx);
		chain.add(10, Tag::new("late", true, &log));
		chain.add(0, Tag::new("first", true, &log));
		chain.add(0, Tag::new("second", true, &log));

		let key = ctx.new_key();
		let mut data = Vec::new();
		assert!(chain.process_data("hair", &key, &0, &mut data).unwrap());
		assert_eq!(data, vec!["first", "second", "late"]);
	}

	#[test]
	fn modified_is_or_reduced_without_short_circuit() {
		let ctx = ScopeContext::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = Chain::new(&ctx);
		chain.add(0, Tag::new("edits", true, &log));
		chain.add(1, Tag::new("observes", false, &log));

		let key = ctx.new_key();
		let mut data = Vec::new();
		assert!(chain.process_data("hair", &key, &0, &mut data).unwrap());
		assert_eq!(*log.lock(), vec!["edits", "observes"]);

		let quiet = Chain::new(&ctx);
		quiet.add(0, Tag::new("observes", false, &log));
		assert!(!quiet.process_data("hair", &key, &0, &mut data).unwrap());
	}

	#[test]
	fn membership_changes_invalidate_registered_keys() {
		let ctx = ScopeContext::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = Chain::new(&ctx);
		let handle = chain.add(0, Tag::new("a", true, &log));

		let key = ctx.new_key();
		chain.register_scopes("hair", &key).unwrap();
		assert!(key.contains(chain.scope()));

		assert!(handle.remove());
		assert!(!key.is_valid());
		assert!(handle.is_removed());
		assert!(!handle.remove());
		assert!(chain.is_empty());
	}

	#[test]
	fn weak_children_drop_out() {
		let ctx = ScopeContext::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = Chain::new(&ctx);
		let kept = Tag::new("kept", true, &log);
		let transient = Tag::new("transient", true, &log);
		chain.add(0, kept);
		chain.add_weak(1, &transient);
		assert_eq!(chain.len(), 2);

		drop(transient);
		let key = ctx.new_key();
		let mut data = Vec::new();
		chain.process_data("hair", &key, &0, &mut data).unwrap();
		assert_eq!(data, vec!["kept"]);
		assert_eq!(chain.inner.children.read().len(), 1);
	}

	#[tokio::test]
	async fn async_fold_threads_data_through_children() {
		let ctx = ScopeContext::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain: CompositeProcessor<dyn AsyncDataProcessor<str, u32, Vec<&'static str>>> = CompositeProcessor::new(&ctx);
		chain.add(1, Arc::new(crate::SyncProcessor(Tag::new("b", true, &log))));
		chain.add(0, Arc::new(crate::SyncProcessor(Tag::new("a", false, &log))));

		let key = ctx.new_key();
		let cancel = CancellationToken::new();
		let out = chain.process_data_async("hair", &key, &0, Vec::new(), &cancel).await.unwrap();
		assert_eq!(out, Processed::modified(vec!["b"]));
		assert_eq!(*log.lock(), vec!["a", "b"]);
	}
}
