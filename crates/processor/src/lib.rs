#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Composable data processors memoized over scope configurations.
//!
//! # Main Types
//!
//! - [`DataProcessor`] / [`AsyncDataProcessor`] - The processing contracts
//! - [`CompositeProcessor`] - Ordered chain folding every child
//! - [`ProcessorMux`] - Runtime-switchable slot selection
//! - [`FilterProcessor`] - Predicate gating
//! - [`DataProcessorCache`] / [`AsyncDataProcessorCache`] - Two-level memoization
//!
//! Every type here is itself a processor, so they nest freely: a cache can wrap a mux
//! of composites, and a composite can hold caches.

pub mod cache;
pub mod composite;
pub mod filter;
pub mod mux;
mod processor;

pub use cache::{AsyncDataProcessorCache, DataProcessorCache};
pub use composite::{ChildHandle, CompositeProcessor};
pub use filter::FilterProcessor;
pub use mux::ProcessorMux;
pub use processor::{AsyncDataProcessor, DataProcessor, Processed, SharedAsyncProcessor, SharedProcessor, SyncProcessor};
