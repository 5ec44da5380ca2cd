//! The public cache facade

use crate::builder::{CacheBuilder, CacheConfig};
use crate::cell::Cell;
use crate::digest::{KeyDigest, Marshal};
use crate::error::{Error, Result};
use crate::purge::PurgeScheduler;
use crate::store::{CacheGuard, Claim, Store};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Purge interval that disables the background purge thread
pub const NO_PURGE: Duration = Duration::ZERO;

/// Thread-safe memoizing cache keyed by the content hash of marshaled keys
///
/// Values are cloned out on every read; wrap expensive values in [`Arc`].
pub struct Cache<V> {
    store: Arc<Store<V>>,
    purger: Option<PurgeScheduler>,
}

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache that purges itself every `purge_interval`
    ///
    /// [`NO_PURGE`] (zero) disables purging.
    ///
    /// # Errors
    ///
    /// Returns an error if the purge thread cannot be spawned
    pub fn new(purge_interval: Duration) -> Result<Self> {
        CacheBuilder::new().purge_interval(purge_interval).build()
    }

    pub(crate) fn with_config(config: &CacheConfig) -> Result<Self> {
        let store = Arc::new(Store::new());
        let purger = if config.purge_interval.is_zero() {
            None
        } else {
            let target = Arc::clone(&store);
            Some(PurgeScheduler::start(
                config.purge_interval,
                &config.thread_name,
                move || target.purge(),
            )?)
        };
        Ok(Self { store, purger })
    }

    /// Store `value` under `key`, replacing any existing entry
    ///
    /// If the key was still being fetched by [`Cache::load_or_store`], the callers
    /// waiting on that fetch receive `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn store<K: Marshal + ?Sized>(&self, key: &K, value: V) -> Result<()> {
        let digest = KeyDigest::of(key)?;
        self.store.store(digest, value);
        Ok(())
    }

    /// Look up the value for `key`
    ///
    /// Blocks while the entry is being fetched by [`Cache::load_or_store`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized, [`Error::NotFound`]
    /// if there is no entry, or [`Error::FetchFailed`] if the in-flight fetch failed
    pub fn load<K: Marshal + ?Sized>(&self, key: &K) -> Result<V> {
        let digest = KeyDigest::of(key)?;
        let cell = self.store.get(digest).ok_or(Error::not_found(digest))?;
        if cell.is_pending() {
            tracing::debug!(%digest, "Waiting on in-flight fetch");
        }
        let value = cell.wait(digest)?;
        tracing::trace!(%digest, "Cache hit");
        Ok(value)
    }

    /// Return the cached value for `key`, running `fetch` once to populate it on a miss
    ///
    /// Concurrent callers that miss on the same key share one call to `fetch`; the
    /// others block until it finishes and then receive its value. If `fetch` fails,
    /// its error is returned verbatim to the caller that ran it, waiting callers get
    /// [`Error::FetchFailed`], and the entry is removed so a later call retries.
    ///
    /// `fetch` must not call back into the cache for the same key.
    ///
    /// # Errors
    ///
    /// Returns the error of `fetch`, or an [`Error`] converted into `E` when the key
    /// cannot be serialized or a shared fetch failed
    pub fn load_or_store<K, F, E>(&self, key: &K, fetch: F) -> std::result::Result<V, E>
    where
        K: Marshal + ?Sized,
        F: FnOnce() -> std::result::Result<V, E>,
        E: From<Error> + fmt::Display,
    {
        let digest = KeyDigest::of(key)?;
        match self.store.claim(digest) {
            Claim::Existing(cell) => {
                if cell.is_pending() {
                    tracing::debug!(%digest, "Waiting on in-flight fetch");
                }
                Ok(cell.wait(digest)?)
            }
            Claim::Owner(cell) => {
                tracing::debug!(%digest, "Cache miss, fetching");
                let pending = PendingFetch {
                    store: &self.store,
                    digest,
                    cell,
                    settled: false,
                };
                match fetch() {
                    Ok(value) => {
                        pending.resolve(value.clone());
                        Ok(value)
                    }
                    Err(err) => {
                        pending.fail(err.to_string());
                        Err(err)
                    }
                }
            }
        }
    }

    /// Remove the entry for `key`, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn delete<K: Marshal + ?Sized>(&self, key: &K) -> Result<bool> {
        let digest = KeyDigest::of(key)?;
        Ok(self.store.remove(digest))
    }

    /// Whether an entry (ready or still being fetched) exists for `key`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn contains<K: Marshal + ?Sized>(&self, key: &K) -> Result<bool> {
        Ok(self.store.contains(KeyDigest::of(key)?))
    }

    /// Visit cached values until `visit` returns false
    ///
    /// The entry list is taken under a brief shared lock and visited after the lock is
    /// released, so `visit` may call back into the cache. Mutations that happen during
    /// the pass may or may not be observed. Entries still being fetched are skipped.
    /// For a scan that excludes concurrent mutation use [`CacheGuard::range`].
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&V) -> bool,
    {
        for cell in self.store.cells() {
            if let Some(value) = cell.get() {
                if !visit(&value) {
                    break;
                }
            }
        }
    }

    /// Drop every entry
    pub fn purge(&self) {
        let dropped = self.store.purge();
        tracing::debug!(dropped, "Purged cache");
    }

    /// Number of entries, including ones still being fetched
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns true if the cache has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the cache's exclusive lock
    ///
    /// Every other thread blocks in its cache operations until the guard is released.
    /// Use the guard's methods for the locked sequence; calling a [`Cache`] method from
    /// this thread while the guard is alive panics.
    pub fn lock(&self) -> CacheGuard<'_, V> {
        self.store.lock()
    }

    /// Stop the background purge thread
    ///
    /// Does nothing for a cache built without a purge interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStopped`] if the purge thread was already stopped
    pub fn stop(&self) -> Result<()> {
        // The purge thread may be blocked on the lock this thread holds.
        self.store.assert_not_held("stop");
        match &self.purger {
            Some(purger) => purger.stop(),
            None => Ok(()),
        }
    }

    /// Whether a purge thread is configured and still running
    #[must_use]
    pub fn is_purging(&self) -> bool {
        self.purger.as_ref().is_some_and(PurgeScheduler::is_running)
    }

    /// Configured purge interval, `None` when purging is disabled
    #[must_use]
    pub fn purge_interval(&self) -> Option<Duration> {
        self.purger.as_ref().map(PurgeScheduler::interval)
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field(
                "purge_interval",
                &self.purger.as_ref().map(PurgeScheduler::interval),
            )
            .finish_non_exhaustive()
    }
}

/// Settles a claimed cell exactly once, failing it if the fetch unwinds
struct PendingFetch<'a, V: Clone> {
    store: &'a Store<V>,
    digest: KeyDigest,
    cell: Arc<Cell<V>>,
    settled: bool,
}

impl<V: Clone> PendingFetch<'_, V> {
    fn resolve(mut self, value: V) {
        self.settled = true;
        // False when a store() replaced the entry mid-fetch and already woke our waiters.
        if !self.cell.resolve(value) {
            tracing::debug!(digest = %self.digest, "Entry replaced during fetch");
        }
    }

    fn fail(mut self, message: String) {
        self.settled = true;
        self.abandon(message);
    }

    // Waiters are woken before the map lock is taken for removal.
    fn abandon(&self, message: String) {
        self.cell.fail(message);
        self.store.remove_if_same(self.digest, &self.cell);
    }
}

impl<V: Clone> Drop for PendingFetch<'_, V> {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon("fetch panicked".to_string());
        }
    }
}
