#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Scope-keyed memoization and invalidation.
//!
//! Derived results are computed from a target plus the set of dynamic conditions it
//! currently depends on. Each condition is a [`Scope`]; the conditions a query depends on
//! are recorded in a [`ScopeKey`]; a [`ScopedCache`] shares one result per distinct scope
//! configuration and drops it the instant any of its scopes is invalidated, without the
//! scope ever enumerating its consumers.
//!
//! ```
//! use std::sync::Arc;
//!
//! use tether_scope::{ScopeContext, ScopeKey, ScopedCache, ScopedValue};
//!
//! struct Frames(Vec<u32>);
//! impl ScopedValue for Frames {}
//!
//! let ctx = ScopeContext::new();
//! let level = ctx.named_scope("level");
//!
//! let registrar_scope = level.clone();
//! let cache = ScopedCache::new(
//! 	&ctx,
//! 	move |_: &str, key: &ScopeKey| registrar_scope.register_key(key).map(|()| true),
//! 	|_: &str, _: &ScopeKey| Ok(Frames(vec![1, 2, 3])),
//! );
//!
//! let a = cache.get("player").unwrap().unwrap();
//! let b = cache.get("npc").unwrap().unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//!
//! level.invalidate();
//! let c = cache.get("player").unwrap().unwrap();
//! assert!(!Arc::ptr_eq(&a, &c));
//! ```

pub mod cache;
pub mod config;
mod context;
mod error;
pub mod key;
pub mod scope;

pub use cache::{ScopeRegistrar, ScopedCache, ScopedTarget, ScopedValue, SelfRegistrar};
pub use config::ContextConfig;
pub use context::{ScopeContext, ScopeInfo};
pub use error::{Error, Result};
pub use key::{AuxValue, KeyId, KeyOptions, ScopeKey, ScopeSignature, Validity};
pub use scope::{Scope, ScopeBuilder, ScopeId};
