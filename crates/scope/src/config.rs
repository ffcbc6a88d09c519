//! Scope context configuration.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunables owned by a [`crate::ScopeContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
	/// Record named scopes so [`crate::ScopeContext::named_scopes`] can list them.
	pub track_named_scopes: bool,
	/// Number of registration retries after which a warning is logged.
	///
	/// Retries caused by concurrent invalidation are never surfaced as errors; this only
	/// makes pathological invalidation storms visible.
	pub retry_warn_threshold: u32,
}

impl Default for ContextConfig {
	fn default() -> Self {
		Self {
			track_named_scopes: true,
			retry_warn_threshold: 64,
		}
	}
}

impl ContextConfig {
	/// Parses a configuration from TOML. Missing fields take their defaults.
	pub fn from_toml_str(src: &str) -> Result<Self> {
		Ok(toml::from_str(src)?)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::Error;

	#[test]
	fn empty_document_yields_defaults() {
		assert_eq!(ContextConfig::from_toml_str("").unwrap(), ContextConfig::default());
	}

	#[test]
	fn overrides_are_applied() {
		let config = ContextConfig::from_toml_str("track_named_scopes = false\nretry_warn_threshold = 3\n").unwrap();
		assert_eq!(
			config,
			ContextConfig {
				track_named_scopes: false,
				retry_warn_threshold: 3,
			}
		);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let err = ContextConfig::from_toml_str("eviction = \"lru\"").unwrap_err();
		assert!(matches!(err, Error::Config(_)));
	}
}
