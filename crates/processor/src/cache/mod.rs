//! Two-level memoization of processor output.
//!
//! The outer level is a [`ScopedCache`](tether_scope::ScopedCache) keyed by scope
//! configuration; each of its values is an inner table keyed by the processing
//! identifier. Invalidating any scope of a configuration drops its whole inner table.
//!
//! A target for which the processor registers no scope at all has no scoped data and is
//! processed uncached.

mod async_cache;
mod sync_cache;

pub use self::async_cache::AsyncDataProcessorCache;
pub use self::sync_cache::DataProcessorCache;
