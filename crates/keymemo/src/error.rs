//! Error types for the keyed memo cache
//!
//! Every fallible cache operation returns [`Result`]. Errors are handed back to the
//! immediate caller; the cache itself never logs, retries or swallows them.

use crate::digest::KeyDigest;
use thiserror::Error;

/// Boxed error produced by a key's [`Marshal`](crate::Marshal) implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while using a [`Cache`](crate::Cache)
#[derive(Error, Debug)]
pub enum Error {
    /// The key could not be serialized into bytes
    #[error("Failed to marshal cache key: {source}")]
    Marshal {
        /// Error returned by the key's marshaler, unchanged
        #[source]
        source: BoxError,
    },

    /// No entry exists for the key's digest
    #[error("No cache entry for key {digest}")]
    NotFound {
        /// Digest of the key that was looked up
        digest: KeyDigest,
    },

    /// The entry is still being fetched and the caller cannot wait for it
    #[error("Cache entry for key {digest} is still being fetched")]
    Pending {
        /// Digest of the key being populated
        digest: KeyDigest,
    },

    /// The single-flight fetch this caller was waiting on failed
    #[error("Fetch for key {digest} failed: {message}")]
    FetchFailed {
        /// Digest of the key being populated
        digest: KeyDigest,
        /// Rendered error of the failed fetch
        message: String,
    },

    /// The purge scheduler was stopped a second time
    #[error("Purge scheduler already stopped")]
    AlreadyStopped,

    /// Invalid cache configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration problem
        message: String,
    },
}

impl Error {
    /// Create a marshal error from any marshaler failure
    #[must_use]
    pub fn marshal(source: impl Into<BoxError>) -> Self {
        Self::Marshal {
            source: source.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub const fn not_found(digest: KeyDigest) -> Self {
        Self::NotFound { digest }
    }

    /// Create a pending-entry error
    #[must_use]
    pub const fn pending(digest: KeyDigest) -> Self {
        Self::Pending { digest }
    }

    /// Create a fetch-failed error
    #[must_use]
    pub fn fetch_failed(digest: KeyDigest, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            digest,
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

    /// Returns true for [`Error::NotFound`]
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`Error::Marshal`]
    #[must_use]
    pub const fn is_marshal(&self) -> bool {
        matches!(self, Self::Marshal { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
