//! Runtime-switchable processor selection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tether_scope::{Error, Result, Scope, ScopeContext, ScopeKey};
use tokio_util::sync::CancellationToken;

use crate::processor::{AsyncDataProcessor, DataProcessor, Processed};

struct Slot<P: ?Sized> {
	scope: Scope,
	processor: RwLock<Option<Arc<P>>>,
}

/// Delegates to one of N slots, selected by an active index.
///
/// Every key passing through the mux is registered on an index scope and on the active
/// slot's scope. Switching the active index invalidates the index scope; replacing a
/// slot's processor invalidates only that slot's scope. Results cached for other slots
/// survive both.
pub struct ProcessorMux<P: ?Sized> {
	index_scope: Scope,
	active: AtomicUsize,
	slots: Box<[Slot<P>]>,
}

impl<P: ?Sized> ProcessorMux<P> {
	/// Creates a mux with `len` empty slots. Slot 0 is active.
	pub fn new(context: &ScopeContext, len: usize) -> Self {
		Self::build(context, (0..len).map(|_| None))
	}

	/// Creates a mux with one slot per processor. Slot 0 is active.
	pub fn with_slots(context: &ScopeContext, processors: impl IntoIterator<Item = Arc<P>>) -> Self {
		Self::build(context, processors.into_iter().map(Some))
	}

	fn build(context: &ScopeContext, processors: impl Iterator<Item = Option<Arc<P>>>) -> Self {
		let slots = processors
			.map(|processor| Slot {
				scope: context.anonymous_scope(),
				processor: RwLock::new(processor),
			})
			.collect();
		Self {
			index_scope: context.anonymous_scope(),
			active: AtomicUsize::new(0),
			slots,
		}
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	pub fn active_index(&self) -> usize {
		self.active.load(Ordering::Acquire)
	}

	/// Switches the active slot. Switching to the current index is a no-op.
	///
	/// # Errors
	///
	/// [`Error::SlotOutOfRange`] if `index` is not a slot.
	pub fn set_active_index(&self, index: usize) -> Result<()> {
		self.check(index)?;
		let previous = self.active.swap(index, Ordering::AcqRel);
		if previous == index {
			return Ok(());
		}
		tracing::debug!(previous, index, "mux.switch");
		self.index_scope.invalidate_registrars();
		self.index_scope.invalidate();
		Ok(())
	}

	/// Processor currently held by slot `index`.
	pub fn slot(&self, index: usize) -> Result<Option<Arc<P>>> {
		self.check(index)?;
		Ok(self.slots[index].processor.read().clone())
	}

	/// Replaces the processor in slot `index`, returning the previous one.
	pub fn set_slot(&self, index: usize, processor: Option<Arc<P>>) -> Result<Option<Arc<P>>> {
		self.check(index)?;
		let slot = &self.slots[index];
		let previous = std::mem::replace(&mut *slot.processor.write(), processor);
		tracing::debug!(index, "mux.replace_slot");
		slot.scope.invalidate();
		Ok(previous)
	}

	fn check(&self, index: usize) -> Result<()> {
		if index < self.slots.len() {
			Ok(())
		} else {
			Err(Error::SlotOutOfRange { index, len: self.slots.len() })
		}
	}

	/// Registers `key` on the index scope and the active slot's scope, then returns the
	/// active processor. Scopes are registered before the state they guard is read.
	fn register_active(&self, key: &ScopeKey) -> Result<Option<Arc<P>>> {
		self.index_scope.register_key(key)?;
		let Some(slot) = self.slots.get(self.active_index()) else {
			return Ok(None);
		};
		slot.scope.register_key(key)?;
		Ok(slot.processor.read().clone())
	}

	fn active(&self) -> Option<Arc<P>> {
		self.slots.get(self.active_index()).and_then(|slot| slot.processor.read().clone())
	}
}

impl<T, I, D, P> DataProcessor<T, I, D> for ProcessorMux<P>
where
	T: ?Sized,
	I: ?Sized,
	P: DataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		match self.register_active(key)? {
			Some(processor) => processor.register_scopes(target, key),
			None => Ok(()),
		}
	}

	fn process_data(&self, target: &T, key: &ScopeKey, id: &I, data: &mut D) -> Result<bool> {
		match self.active() {
			Some(processor) => processor.process_data(target, key, id, data),
			None => Ok(false),
		}
	}
}

#[async_trait]
impl<T, I, D, P> AsyncDataProcessor<T, I, D> for ProcessorMux<P>
where
	T: ?Sized + Sync,
	I: ?Sized + Sync,
	D: Send + 'static,
	P: AsyncDataProcessor<T, I, D> + ?Sized,
{
	fn register_scopes(&self, target: &T, key: &ScopeKey) -> Result<()> {
		match self.register_active(key)? {
			Some(processor) => processor.register_scopes(target, key),
			None => Ok(()),
		}
	}

	async fn process_data_async(&self, target: &T, key: &ScopeKey, id: &I, data: D, cancel: &CancellationToken) -> Result<Processed<D>> {
		match self.active() {
			Some(processor) => processor.process_data_async(target, key, id, data, cancel).await,
			None => Ok(Processed::unchanged(data)),
		}
	}
}

impl<P: ?Sized> fmt::Debug for ProcessorMux<P> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProcessorMux")
			.field("slots", &self.slots.len())
			.field("active", &self.active_index())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Replaces the data with a fixed value.
	struct Set(u32);

	impl DataProcessor<str, (), u32> for Set {
		fn register_scopes(&self, _: &str, _: &ScopeKey) -> Result<()> {
			Ok(())
		}

		fn process_data(&self, _: &str, _: &ScopeKey, _: &(), data: &mut u32) -> Result<bool> {
			*data = self.0;
			Ok(true)
		}
	}

	type Mux = ProcessorMux<dyn DataProcessor<str, (), u32>>;

	fn mux(ctx: &ScopeContext) -> Mux {
		let slots: Vec<Arc<dyn DataProcessor<str, (), u32>>> = vec![Arc::new(Set(1)), Arc::new(Set(2))];
		ProcessorMux::with_slots(ctx, slots)
	}

	#[test]
	fn delegates_to_active_slot() {
		let ctx = ScopeContext::new();
		let mux = mux(&ctx);
		let key = ctx.new_key();
		let mut data = 0;

		assert!(mux.process_data("hair", &key, &(), &mut data).unwrap());
		assert_eq!(data, 1);

		mux.set_active_index(1).unwrap();
		mux.process_data("hair", &key, &(), &mut data).unwrap();
		assert_eq!(data, 2);
		assert_eq!(mux.active_index(), 1);
	}

	#[test]
	fn switching_invalidates_registered_keys() {
		let ctx = ScopeContext::new();
		let mux = mux(&ctx);
		let key = ctx.new_key();
		mux.register_scopes("hair", &key).unwrap();
		assert_eq!(key.scope_count(), 2);

		mux.set_active_index(0).unwrap();
		assert!(key.is_valid());

		mux.set_active_index(1).unwrap();
		assert!(!key.is_valid());
	}

	#[test]
	fn replacing_a_slot_only_invalidates_its_keys() {
		let ctx = ScopeContext::new();
		let mux = mux(&ctx);
		let on_zero = ctx.new_key();
		mux.register_scopes("hair", &on_zero).unwrap();

		let previous = mux.set_slot(1, Some(Arc::new(Set(9)))).unwrap();
		assert!(previous.is_some());
		assert!(on_zero.is_valid());

		let replaced = mux.set_slot(0, None).unwrap();
		assert!(replaced.is_some());
		assert!(!on_zero.is_valid());
		assert!(mux.slot(0).unwrap().is_none());

		let key = ctx.new_key();
		let mut data = 5;
		assert!(!mux.process_data("hair", &key, &(), &mut data).unwrap());
		assert_eq!(data, 5);
	}

	#[test]
	fn out_of_range_indices_are_rejected() {
		let ctx = ScopeContext::new();
		let mux = Mux::new(&ctx, 2);
		assert!(matches!(mux.set_active_index(2), Err(Error::SlotOutOfRange { index: 2, len: 2 })));
		assert!(matches!(mux.slot(3), Err(Error::SlotOutOfRange { .. })));
		assert!(matches!(mux.set_slot(7, None), Err(Error::SlotOutOfRange { .. })));
		assert_eq!(mux.active_index(), 0);
	}
}
