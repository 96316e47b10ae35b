//! Error types for the memoization engine
//!
//! Errors originating in the wrapped computation never pass through this
//! type: panics propagate to the caller unchanged. Errors originating in the
//! caching machinery are either surfaced from construction-time operations
//! or degraded to a recompute-without-caching at the call boundary.

use miette::Diagnostic;
use thiserror::Error;

/// Error type for memoization operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A value lacks a deterministic byte encoding and cannot be
    /// fingerprinted
    #[error("value is not hashable: {message}")]
    #[diagnostic(
        code(keepsake::not_hashable),
        help(
            "Arguments and captures must have a deterministic serde encoding; \
             values whose encoding varies per run cannot be cached"
        )
    )]
    NotHashable {
        /// Why the value could not be fingerprinted
        message: String,
    },

    /// Encoding or decoding a cached value failed
    #[error("serialization error: {message}")]
    #[diagnostic(code(keepsake::serialization))]
    Serialization {
        /// Description of the codec failure
        message: String,
    },

    /// The underlying object store or lock failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] keepsake_store::Error),

    /// The group could not be constructed
    #[error("configuration error: {message}")]
    #[diagnostic(code(keepsake::configuration))]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },
}

impl Error {
    /// Create a not-hashable error
    #[must_use]
    pub fn not_hashable(message: impl Into<String>) -> Self {
        Self::NotHashable {
            message: message.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True for lock-acquisition failures.
    #[must_use]
    pub fn is_lock(&self) -> bool {
        matches!(self, Self::Store(keepsake_store::Error::Lock { .. }))
    }
}

/// Result type for memoization operations
pub type Result<T> = std::result::Result<T, Error>;
