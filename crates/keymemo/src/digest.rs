//! Content addressing for cache keys
//!
//! A key is never stored. It is marshaled to bytes, the bytes are hashed with SHA-256,
//! and the first [`DIGEST_LEN`] bytes of the hash become the map key. Two keys that
//! marshal to the same bytes are the same key as far as the cache is concerned.
//!
//! Truncating to 8 bytes puts the birthday bound at roughly 2^32 distinct keys. A
//! collision makes two keys share one entry (last write wins); it is not detected.

use crate::error::{BoxError, Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hash bytes kept in a [`KeyDigest`]
pub const DIGEST_LEN: usize = 8;

/// Capability to turn a key into a deterministic byte sequence
///
/// Equal logical keys must produce equal bytes. Failing is allowed; the failure is
/// surfaced to the caller as [`Error::Marshal`] and nothing is hashed.
pub trait Marshal {
    /// Serialize the key
    ///
    /// # Errors
    ///
    /// Returns any error that prevents the key from being serialized
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError>;
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        (**self).marshal()
    }
}

impl Marshal for str {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        Ok(self.as_bytes().to_vec())
    }
}

impl Marshal for String {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        self.as_str().marshal()
    }
}

impl Marshal for [u8] {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        Ok(self.to_vec())
    }
}

impl Marshal for Vec<u8> {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        Ok(self.clone())
    }
}

macro_rules! marshal_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
                    Ok(self.to_be_bytes().to_vec())
                }
            }
        )*
    };
}

marshal_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Marshals any serde-serializable value as JSON
///
/// Struct fields serialize in declaration order, so equal values give equal bytes.
/// Map types with unspecified iteration order (`HashMap`) do not; prefer `BTreeMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Json<T>(pub T);

impl<T: Serialize> Marshal for Json<T> {
    fn marshal(&self) -> std::result::Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

/// Truncated SHA-256 digest of a marshaled key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyDigest([u8; DIGEST_LEN]);

impl KeyDigest {
    /// Marshal `key` and hash the result
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] with the marshaler's error if the key cannot be
    /// serialized
    pub fn of<K: Marshal + ?Sized>(key: &K) -> Result<Self> {
        let bytes = key.marshal().map_err(Error::marshal)?;
        Ok(Self::from_marshaled(&bytes))
    }

    /// Hash bytes that were already produced by a marshaler
    #[must_use]
    pub fn from_marshaled(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = hasher.finalize();

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hash.as_slice()[..DIGEST_LEN]);
        Self(digest)
    }

    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// The digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({self})")
    }
}
