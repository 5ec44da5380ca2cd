//! Content-addressed memoizing cache
//!
//! `keymemo` keeps values in memory under the truncated SHA-256 digest of a marshaled
//! key. It provides:
//! - Point lookups, unconditional stores and deletes
//! - Single-flight population: concurrent misses on one key run the fetch once
//! - Whole-cache purge, on demand or from a background thread at a fixed interval
//! - An exclusive lock guard for composing atomic multi-step sequences
//!
//! # Example
//!
//! ```
//! use keymemo::{Cache, Error, NO_PURGE};
//!
//! let cache: Cache<String> = Cache::new(NO_PURGE)?;
//!
//! let greeting = cache.load_or_store("greeting", || Ok::<_, Error>("hello".to_string()))?;
//! assert_eq!(greeting, "hello");
//! assert_eq!(cache.load("greeting")?, "hello");
//!
//! let mut guard = cache.lock();
//! let mut seen = 0;
//! guard.range(|_| {
//!     seen += 1;
//!     true
//! });
//! guard.delete("greeting")?;
//! guard.unlock();
//!
//! assert_eq!(seen, 1);
//! assert!(cache.is_empty());
//! # Ok::<(), keymemo::Error>(())
//! ```
//!
//! # Key identity
//!
//! Keys implement [`Marshal`]. Two keys whose marshaled bytes are equal address the
//! same entry, whatever their Rust types. [`Json`] marshals any serde-serializable
//! value.

pub mod builder;
pub mod cache;
mod cell;
pub mod digest;
pub mod error;
mod purge;
mod store;

pub use builder::{CacheBuilder, CacheConfig, DEFAULT_THREAD_NAME};
pub use cache::{Cache, NO_PURGE};
pub use digest::{DIGEST_LEN, Json, KeyDigest, Marshal};
pub use error::{BoxError, Error, Result};
pub use store::CacheGuard;
