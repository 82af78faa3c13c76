//! In-memory cache backend
//!
//! Fast, single-process, no persistence. Backs the test suite and doubles as
//! a reference implementation of the backend contract: write-buffered
//! transactions with read-your-writes, conditional operations, and fault
//! injection hooks for exercising rollback, retry and cancellation paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{AtomicOps, CacheBackend, CacheError};
use crate::values::StoredValue;

type BucketKey = (String, String);

#[derive(Debug)]
struct Shared {
    data: Mutex<HashMap<BucketKey, StoredValue>>,
    fail_commits: AtomicU32,
    fail_puts: AtomicU32,
    cancel_ops: AtomicU32,
    running: AtomicBool,
    atomics_enabled: bool,
}

impl Shared {
    fn new(atomics_enabled: bool) -> Self {
        Shared {
            data: Mutex::new(HashMap::new()),
            fail_commits: AtomicU32::new(0),
            fail_puts: AtomicU32::new(0),
            cancel_ops: AtomicU32::new(0),
            running: AtomicBool::new(true),
            atomics_enabled,
        }
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    fn check_op(&self) -> Result<(), CacheError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(CacheError::backend("cache is not running"));
        }
        if Self::consume(&self.cancel_ops) {
            // Wrapped rather than returned directly so callers must walk the
            // cause chain, the way real backends surface interruption.
            return Err(CacheError::backend_caused_by(
                "connection reset",
                CacheError::Cancelled,
            ));
        }
        Ok(())
    }
}

/// Shared in-memory store. Hand one [`session`](InMemoryCache::session) to
/// each worker.
#[derive(Clone)]
pub struct InMemoryCache {
    shared: Arc<Shared>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache {
            shared: Arc::new(Shared::new(true)),
        }
    }

    /// A store without the conditional-operation capability, for exercising
    /// configurations that require it.
    pub fn without_atomics() -> Self {
        InMemoryCache {
            shared: Arc::new(Shared::new(false)),
        }
    }

    /// New session sharing this store. Transaction state is per session.
    pub fn session(&self) -> InMemorySession {
        InMemorySession {
            shared: self.shared.clone(),
            tx: Mutex::new(None),
        }
    }

    /// Seed an entry directly, bypassing sessions. Test setup helper.
    pub fn insert(&self, bucket: &str, key: &str, value: StoredValue) {
        self.shared
            .data
            .lock()
            .insert((bucket.to_string(), key.to_string()), value);
    }

    pub fn get_stored(&self, bucket: &str, key: &str) -> Option<StoredValue> {
        self.shared
            .data
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole store, for durability sweeps.
    pub fn entries(&self) -> Vec<(String, String, StoredValue)> {
        self.shared
            .data
            .lock()
            .iter()
            .map(|((b, k), v)| (b.clone(), k.clone(), v.clone()))
            .collect()
    }

    /// Make the next `n` commits fail. The failing transaction's writes are
    /// discarded, as a rolled-back commit would be.
    pub fn fail_next_commits(&self, n: u32) {
        self.shared.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` plain puts fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.shared.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` operations fail with a cancellation buried in the
    /// error chain.
    pub fn cancel_next_ops(&self, n: u32) {
        self.shared.cancel_ops.store(n, Ordering::SeqCst);
    }

    /// Mark the store as stopped; `is_running` turns false and every
    /// subsequent operation fails.
    pub fn shut_down(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// One worker's handle onto an [`InMemoryCache`].
pub struct InMemorySession {
    shared: Arc<Shared>,
    // None: autocommit. Some: open transaction's write buffer, where a None
    // value marks a buffered remove.
    tx: Mutex<Option<HashMap<BucketKey, Option<StoredValue>>>>,
}

impl InMemorySession {
    fn bucket_key(bucket: &str, key: &str) -> BucketKey {
        (bucket.to_string(), key.to_string())
    }

    fn read_merged(&self, bucket: &str, key: &str) -> Option<StoredValue> {
        let bk = Self::bucket_key(bucket, key);
        if let Some(buffer) = self.tx.lock().as_ref() {
            if let Some(buffered) = buffer.get(&bk) {
                return buffered.clone();
            }
        }
        self.shared.data.lock().get(&bk).cloned()
    }
}

#[async_trait]
impl CacheBackend for InMemorySession {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        self.shared.check_op()?;
        Ok(self.read_merged(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, value: StoredValue) -> Result<(), CacheError> {
        self.shared.check_op()?;
        if Shared::consume(&self.shared.fail_puts) {
            return Err(CacheError::backend("injected put failure"));
        }
        let bk = Self::bucket_key(bucket, key);
        let mut tx = self.tx.lock();
        match tx.as_mut() {
            Some(buffer) => {
                buffer.insert(bk, Some(value));
            }
            None => {
                self.shared.data.lock().insert(bk, value);
            }
        }
        Ok(())
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        self.shared.check_op()?;
        let prior = self.read_merged(bucket, key);
        let bk = Self::bucket_key(bucket, key);
        let mut tx = self.tx.lock();
        match tx.as_mut() {
            Some(buffer) => {
                buffer.insert(bk, None);
            }
            None => {
                self.shared.data.lock().remove(&bk);
            }
        }
        Ok(prior)
    }

    async fn start_transaction(&self) -> Result<(), CacheError> {
        self.shared.check_op()?;
        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Err(CacheError::backend("transaction already active"));
        }
        *tx = Some(HashMap::new());
        Ok(())
    }

    async fn end_transaction(&self, commit: bool) -> Result<(), CacheError> {
        let buffer = self.tx.lock().take();
        if !commit {
            // Rollback without an open transaction is tolerated; workers
            // issue best-effort rollbacks during shutdown.
            return Ok(());
        }
        let buffer = buffer.ok_or_else(|| CacheError::backend("no active transaction"))?;
        if Shared::consume(&self.shared.fail_commits) {
            return Err(CacheError::backend("injected commit failure"));
        }
        let mut data = self.shared.data.lock();
        for (bk, write) in buffer {
            match write {
                Some(value) => {
                    data.insert(bk, value);
                }
                None => {
                    data.remove(&bk);
                }
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        if self.shared.atomics_enabled {
            Some(self)
        } else {
            None
        }
    }
}

// Conditional operations act on the shared store directly, outside any open
// write buffer. Races between sessions resolve on the store's single lock.
#[async_trait]
impl AtomicOps for InMemorySession {
    async fn put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: StoredValue,
    ) -> Result<Option<StoredValue>, CacheError> {
        self.shared.check_op()?;
        let bk = Self::bucket_key(bucket, key);
        let mut data = self.shared.data.lock();
        match data.get(&bk) {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                data.insert(bk, value);
                Ok(None)
            }
        }
    }

    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        old: &StoredValue,
        new: StoredValue,
    ) -> Result<bool, CacheError> {
        self.shared.check_op()?;
        let bk = Self::bucket_key(bucket, key);
        let mut data = self.shared.data.lock();
        if data.get(&bk) == Some(old) {
            data.insert(bk, new);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn remove_expected(
        &self,
        bucket: &str,
        key: &str,
        expected: &StoredValue,
    ) -> Result<bool, CacheError> {
        self.shared.check_op()?;
        let bk = Self::bucket_key(bucket, key);
        let mut data = self.shared.data.lock();
        if data.get(&bk) == Some(expected) {
            data.remove(&bk);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::is_cancellation;

    const B: &str = "bucket";

    fn bytes(v: &[u8]) -> StoredValue {
        StoredValue::Bytes(v.to_vec())
    }

    #[tokio::test]
    async fn test_put_get_remove_autocommit() {
        let cache = InMemoryCache::new();
        let session = cache.session();

        session.put(B, "a", bytes(b"1")).await.unwrap();
        assert_eq!(session.get(B, "a").await.unwrap(), Some(bytes(b"1")));

        let prior = session.remove(B, "a").await.unwrap();
        assert_eq!(prior, Some(bytes(b"1")));
        assert_eq!(session.get(B, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transaction_read_your_writes_and_isolation() {
        let cache = InMemoryCache::new();
        let writer = cache.session();
        let reader = cache.session();

        writer.start_transaction().await.unwrap();
        writer.put(B, "k", bytes(b"v")).await.unwrap();

        assert_eq!(writer.get(B, "k").await.unwrap(), Some(bytes(b"v")));
        assert_eq!(reader.get(B, "k").await.unwrap(), None);

        writer.end_transaction(true).await.unwrap();
        assert_eq!(reader.get(B, "k").await.unwrap(), Some(bytes(b"v")));
    }

    #[tokio::test]
    async fn test_rollback_discards_buffer() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        session.put(B, "k", bytes(b"old")).await.unwrap();

        session.start_transaction().await.unwrap();
        session.put(B, "k", bytes(b"new")).await.unwrap();
        session.remove(B, "k").await.unwrap();
        session.end_transaction(false).await.unwrap();

        assert_eq!(session.get(B, "k").await.unwrap(), Some(bytes(b"old")));
    }

    #[tokio::test]
    async fn test_buffered_remove_applies_on_commit() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        session.put(B, "k", bytes(b"v")).await.unwrap();

        session.start_transaction().await.unwrap();
        let prior = session.remove(B, "k").await.unwrap();
        assert_eq!(prior, Some(bytes(b"v")));
        assert_eq!(session.get(B, "k").await.unwrap(), None);
        session.end_transaction(true).await.unwrap();

        assert_eq!(cache.get_stored(B, "k"), None);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_drops_writes() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        cache.fail_next_commits(1);

        session.start_transaction().await.unwrap();
        session.put(B, "k", bytes(b"v")).await.unwrap();
        assert!(session.end_transaction(true).await.is_err());
        assert_eq!(cache.get_stored(B, "k"), None);

        // next transaction goes through
        session.start_transaction().await.unwrap();
        session.put(B, "k", bytes(b"v")).await.unwrap();
        session.end_transaction(true).await.unwrap();
        assert_eq!(cache.get_stored(B, "k"), Some(bytes(b"v")));
    }

    #[tokio::test]
    async fn test_injected_cancellation_is_chained() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        cache.cancel_next_ops(1);

        let err = session.get(B, "k").await.unwrap_err();
        assert!(is_cancellation(&err));
        assert!(session.get(B, "k").await.is_ok());
    }

    #[tokio::test]
    async fn test_put_if_absent_races_to_one_winner() {
        let cache = InMemoryCache::new();
        let a = cache.session();
        let b = cache.session();

        let atomic_a = a.atomic_ops().unwrap();
        let atomic_b = b.atomic_ops().unwrap();

        assert_eq!(atomic_a.put_if_absent(B, "k", bytes(b"a")).await.unwrap(), None);
        assert_eq!(
            atomic_b.put_if_absent(B, "k", bytes(b"b")).await.unwrap(),
            Some(bytes(b"a"))
        );
        assert_eq!(cache.get_stored(B, "k"), Some(bytes(b"a")));
    }

    #[tokio::test]
    async fn test_replace_and_remove_expected() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        session.put(B, "k", bytes(b"1")).await.unwrap();
        let atomic = session.atomic_ops().unwrap();

        assert!(!atomic.replace(B, "k", &bytes(b"2"), bytes(b"3")).await.unwrap());
        assert!(atomic.replace(B, "k", &bytes(b"1"), bytes(b"2")).await.unwrap());

        assert!(!atomic.remove_expected(B, "k", &bytes(b"1")).await.unwrap());
        assert!(atomic.remove_expected(B, "k", &bytes(b"2")).await.unwrap());
        assert_eq!(cache.get_stored(B, "k"), None);
    }

    #[tokio::test]
    async fn test_without_atomics_has_no_capability() {
        let cache = InMemoryCache::without_atomics();
        let session = cache.session();
        assert!(session.atomic_ops().is_none());
    }

    #[tokio::test]
    async fn test_shut_down_fails_operations() {
        let cache = InMemoryCache::new();
        let session = cache.session();
        cache.shut_down();
        assert!(!session.is_running());
        assert!(session.get(B, "k").await.is_err());
    }
}
