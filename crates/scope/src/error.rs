use std::sync::Arc;

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by scopes, keys, caches and processors.
///
/// Lifecycle errors ([`Error::Disposed`], [`Error::InvalidKey`], [`Error::SlotOutOfRange`],
/// [`Error::KeyMismatch`]) indicate caller misuse and are never retried internally.
/// A key becoming invalid mid-registration is not an error at all; callers that race
/// with invalidation retry transparently.
///
/// The type is `Clone` so one deduplicated computation can hand its outcome to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The owning cache, scope or key was torn down.
	#[error("{0} has been disposed")]
	Disposed(&'static str),
	/// A key was registered after it had been invalidated.
	#[error("scope key is no longer valid")]
	InvalidKey,
	/// A multiplexer slot index was outside the configured slot range.
	#[error("slot index {index} out of range (len {len})")]
	SlotOutOfRange { index: usize, len: usize },
	/// A key belongs to a different [`crate::ScopeContext`] than the component it was handed to.
	#[error("scope key belongs to a different scope context")]
	KeyMismatch,
	/// Async work was cancelled before producing a result.
	#[error("operation cancelled")]
	Cancelled,
	/// The task driving a shared computation terminated without publishing a result.
	#[error("in-flight computation aborted")]
	Aborted,
	/// Configuration could not be parsed.
	#[error("invalid configuration: {0}")]
	Config(String),
	/// A processor failed.
	#[error("processor failed: {0}")]
	Processor(Arc<anyhow::Error>),
}

impl Error {
	/// Wraps an arbitrary processor failure.
	pub fn processor(err: impl Into<anyhow::Error>) -> Self {
		Self::Processor(Arc::new(err.into()))
	}

	/// Returns true for [`Error::Cancelled`].
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

impl From<toml::de::Error> for Error {
	fn from(err: toml::de::Error) -> Self {
		Self::Config(err.to_string())
	}
}
