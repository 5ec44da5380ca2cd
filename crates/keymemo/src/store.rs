//! Digest-to-cell map and its locking discipline
//!
//! The map sits behind a reader/writer lock. Cache operations take the lock for their
//! own short critical section. Callers who need several steps to happen atomically take
//! the exclusive lock through [`Cache::lock`](crate::Cache::lock) and receive a
//! [`CacheGuard`], which carries its own lock-free variants of the map operations.
//!
//! The lock is not reentrant. Calling a self-locking cache operation from the thread that
//! holds a [`CacheGuard`] panics instead of deadlocking.

use crate::cell::Cell;
use crate::digest::{KeyDigest, Marshal};
use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) type Map<V> = HashMap<KeyDigest, Arc<Cell<V>>>;

const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(NO_OWNER + 1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique, non-zero id of the calling thread
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Outcome of claiming a digest for single-flight population
pub(crate) enum Claim<V> {
    /// A cell already exists; wait on it
    Existing(Arc<Cell<V>>),
    /// A new pending cell was installed; the claimant must settle it
    Owner(Arc<Cell<V>>),
}

pub(crate) struct Store<V> {
    map: RwLock<Map<V>>,
    // Token of the thread holding a CacheGuard, used to turn same-thread reentry into a panic.
    // Only the holder writes its own token, so a thread always reads back what it stored.
    owner: AtomicU64,
}

impl<V: Clone> Store<V> {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    pub(crate) fn assert_not_held(&self, operation: &str) {
        let held_here = self.owner.load(Ordering::Relaxed) == thread_token();
        assert!(
            !held_here,
            "`{operation}` called while this thread holds the cache lock; use the CacheGuard"
        );
    }

    fn read(&self, operation: &str) -> RwLockReadGuard<'_, Map<V>> {
        self.assert_not_held(operation);
        self.map.read()
    }

    fn write(&self, operation: &str) -> RwLockWriteGuard<'_, Map<V>> {
        self.assert_not_held(operation);
        self.map.write()
    }

    pub(crate) fn lock(&self) -> CacheGuard<'_, V> {
        let map = self.write("lock");
        self.owner.store(thread_token(), Ordering::Relaxed);
        CacheGuard {
            map,
            owner: &self.owner,
        }
    }

    pub(crate) fn store(&self, digest: KeyDigest, value: V) {
        let displaced = insert_ready(&mut self.write("store"), digest, value.clone());
        release_displaced(displaced, value);
    }

    pub(crate) fn get(&self, digest: KeyDigest) -> Option<Arc<Cell<V>>> {
        self.read("load").get(&digest).cloned()
    }

    pub(crate) fn contains(&self, digest: KeyDigest) -> bool {
        self.read("contains").contains_key(&digest)
    }

    pub(crate) fn remove(&self, digest: KeyDigest) -> bool {
        self.write("delete").remove(&digest).is_some()
    }

    /// Install a pending cell for `digest` unless a live one is already there.
    ///
    /// A cell left behind by a failed fetch counts as absent, so the next caller retries.
    pub(crate) fn claim(&self, digest: KeyDigest) -> Claim<V> {
        let mut map = self.write("load_or_store");
        if let Some(existing) = map.get(&digest) {
            if !existing.is_failed() {
                return Claim::Existing(Arc::clone(existing));
            }
        }
        let cell = Arc::new(Cell::pending());
        map.insert(digest, Arc::clone(&cell));
        Claim::Owner(cell)
    }

    /// Drop the entry for `digest` if it is still `cell`.
    pub(crate) fn remove_if_same(&self, digest: KeyDigest, cell: &Arc<Cell<V>>) {
        let mut map = self.write("load_or_store");
        if map.get(&digest).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            map.remove(&digest);
        }
    }

    /// Swap the backing map for an empty one, returning how many entries were dropped.
    pub(crate) fn purge(&self) -> usize {
        let old = std::mem::take(&mut *self.write("purge"));
        old.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.read("size").len()
    }

    /// Cells present right now, for scanning without holding the lock.
    pub(crate) fn cells(&self) -> Vec<Arc<Cell<V>>> {
        self.read("range").values().cloned().collect()
    }
}

fn insert_ready<V: Clone>(map: &mut Map<V>, digest: KeyDigest, value: V) -> Option<Arc<Cell<V>>> {
    map.insert(digest, Arc::new(Cell::ready(value)))
}

// Waiters parked on a pending cell that was overwritten receive the stored value.
fn release_displaced<V: Clone>(displaced: Option<Arc<Cell<V>>>, value: V) {
    if let Some(cell) = displaced {
        cell.resolve(value);
    }
}

/// Exclusive hold on a cache's map
///
/// While a guard is alive every other thread blocks in its cache operations, so a
/// sequence of guard calls (scan, then mutate) is atomic. Dropping the guard or calling
/// [`CacheGuard::unlock`] releases the lock.
///
/// Only use the guard's own methods while holding it: calling a self-locking
/// [`Cache`](crate::Cache) operation from the same thread panics.
#[must_use = "the cache is unlocked as soon as the guard is dropped"]
pub struct CacheGuard<'a, V> {
    map: RwLockWriteGuard<'a, Map<V>>,
    owner: &'a AtomicU64,
}

impl<V: Clone> CacheGuard<'_, V> {
    /// Visit every ready value until `visit` returns false
    ///
    /// Entries still being fetched are skipped. No entry can be added, removed or
    /// purged during the scan.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&V) -> bool,
    {
        for cell in self.map.values() {
            if let Some(value) = cell.get() {
                if !visit(&value) {
                    break;
                }
            }
        }
    }

    /// Look up a key without taking the lock again
    ///
    /// Never blocks: an entry still being fetched is reported as [`Error::Pending`],
    /// since its fetch may itself be waiting on this lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized, [`Error::NotFound`]
    /// if there is no entry, [`Error::Pending`] if it is still being fetched, or
    /// [`Error::FetchFailed`] if the entry's fetch failed
    pub fn load<K: Marshal + ?Sized>(&self, key: &K) -> Result<V> {
        let digest = KeyDigest::of(key)?;
        let cell = self.map.get(&digest).ok_or(Error::not_found(digest))?;
        cell.poll(digest).unwrap_or_else(|| Err(Error::pending(digest)))
    }

    /// Whether an entry exists for the key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn contains<K: Marshal + ?Sized>(&self, key: &K) -> Result<bool> {
        Ok(self.map.contains_key(&KeyDigest::of(key)?))
    }

    /// Store a value while holding the lock
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn store<K: Marshal + ?Sized>(&mut self, key: &K, value: V) -> Result<()> {
        let digest = KeyDigest::of(key)?;
        let displaced = insert_ready(&mut self.map, digest, value.clone());
        release_displaced(displaced, value);
        Ok(())
    }

    /// Remove the entry for a key, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Marshal`] if the key cannot be serialized
    pub fn delete<K: Marshal + ?Sized>(&mut self, key: &K) -> Result<bool> {
        let digest = KeyDigest::of(key)?;
        Ok(self.map.remove(&digest).is_some())
    }

    /// Drop every entry
    pub fn purge(&mut self) {
        *self.map = HashMap::new();
    }

    /// Number of entries, including ones still being fetched
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Release the lock
    pub fn unlock(self) {
        drop(self);
    }
}

impl<V> Drop for CacheGuard<'_, V> {
    fn drop(&mut self) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
    }
}

impl<V> fmt::Debug for CacheGuard<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGuard")
            .field("entries", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> KeyDigest {
        KeyDigest::from_bytes([byte; 8])
    }

    #[test]
    fn test_store_and_get() {
        let store = Store::new();
        store.store(digest(1), "one");
        assert_eq!(store.get(digest(1)).unwrap().get(), Some("one"));
        assert!(store.get(digest(2)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_releases_pending_waiters() {
        let store = Store::new();
        let Claim::Owner(pending) = store.claim(digest(1)) else {
            panic!("expected to own the new cell");
        };
        store.store(digest(1), 10);

        assert_eq!(pending.wait(digest(1)).unwrap(), 10);
        assert!(!Arc::ptr_eq(&pending, &store.get(digest(1)).unwrap()));
    }

    #[test]
    fn test_claim_coalesces() {
        let store: Store<u8> = Store::new();
        let Claim::Owner(first) = store.claim(digest(3)) else {
            panic!("first claim should own the cell");
        };
        let Claim::Existing(second) = store.claim(digest(3)) else {
            panic!("second claim should see the pending cell");
        };
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_claim_replaces_failed_cell() {
        let store: Store<u8> = Store::new();
        let Claim::Owner(first) = store.claim(digest(3)) else {
            panic!("first claim should own the cell");
        };
        first.fail("boom".to_string());

        let Claim::Owner(retry) = store.claim(digest(3)) else {
            panic!("a failed cell should be replaced");
        };
        assert!(!Arc::ptr_eq(&first, &retry));
    }

    #[test]
    fn test_remove_if_same_keeps_newer_entry() {
        let store = Store::new();
        let Claim::Owner(pending) = store.claim(digest(4)) else {
            panic!("expected to own the new cell");
        };
        store.store(digest(4), 1);
        store.remove_if_same(digest(4), &pending);
        assert!(store.contains(digest(4)));
    }

    #[test]
    fn test_purge_counts_dropped_entries() {
        let store = Store::new();
        for byte in 0..5 {
            store.store(digest(byte), byte);
        }
        assert_eq!(store.purge(), 5);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_guard_operations() {
        let store = Store::new();
        store.store(KeyDigest::of("a").unwrap(), 1);
        store.store(KeyDigest::of("b").unwrap(), 2);

        let mut guard = store.lock();
        assert_eq!(guard.len(), 2);
        assert_eq!(guard.load("a").unwrap(), 1);
        assert!(guard.contains("b").unwrap());

        let mut seen = Vec::new();
        guard.range(|value| {
            seen.push(*value);
            true
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);

        guard.store("c", 3).unwrap();
        assert!(guard.delete("a").unwrap());
        assert!(!guard.delete("a").unwrap());
        assert_eq!(guard.len(), 2);

        guard.purge();
        assert!(guard.is_empty());
        guard.unlock();

        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_guard_range_stops_early() {
        let store = Store::new();
        for byte in 0..10 {
            store.store(digest(byte), byte);
        }
        let guard = store.lock();
        let mut visited = 0;
        guard.range(|_| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_guard_load_reports_pending_entry() {
        let store: Store<u8> = Store::new();
        let Claim::Owner(pending) = store.claim(KeyDigest::of("slow").unwrap()) else {
            panic!("expected to own the new cell");
        };
        store.store(KeyDigest::of("ready").unwrap(), 1);

        let guard = store.lock();
        assert!(matches!(guard.load("slow"), Err(Error::Pending { .. })));
        assert_eq!(guard.load("ready").unwrap(), 1);
        guard.unlock();

        pending.resolve(2);
        assert_eq!(store.lock().load("slow").unwrap(), 2);
    }

    #[test]
    fn test_thread_tokens_are_distinct() {
        let here = thread_token();
        assert_ne!(here, NO_OWNER);
        assert_eq!(here, thread_token());
        assert_ne!(here, std::thread::spawn(thread_token).join().unwrap());
    }

    #[test]
    fn test_guard_on_other_thread_does_not_trip_reentry_check() {
        let store: Arc<Store<u8>> = Arc::new(Store::new());
        let guard = store.lock();
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.len())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!reader.is_finished());
        drop(guard);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "holds the cache lock")]
    fn test_reentry_panics() {
        let store: Store<u8> = Store::new();
        let _guard = store.lock();
        store.len();
    }

    #[test]
    fn test_lock_released_after_drop() {
        let store: Store<u8> = Store::new();
        drop(store.lock());
        store.store(digest(1), 1);
        assert_eq!(store.len(), 1);
    }
}
