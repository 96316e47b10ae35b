//! Error types for store backends and locks

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for object store and lock operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during store operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(keepsake::store::io),
        help("Check file permissions, free disk space, and that the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// The lock primitive could not be acquired or created
    #[error("Lock unavailable: {message}")]
    #[diagnostic(
        code(keepsake::store::lock),
        help("Ensure the lock file path is creatable and the filesystem supports advisory locks")
    )]
    Lock {
        /// Description of the lock failure
        message: String,
        /// The underlying I/O error, if any
        #[source]
        source: Option<std::io::Error>,
    },

    /// Store contents failed a structural check
    #[error("Store validation error: {message}")]
    #[diagnostic(code(keepsake::store::validation))]
    Validation {
        /// Description of the validation failure
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a lock error
    #[must_use]
    pub fn lock(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::Lock {
            message: message.into(),
            source,
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;
