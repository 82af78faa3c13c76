//! Shared helpers for the stressor integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use kvstress::{
    AtomicOps, CacheBackend, CacheError, LogicEnv, ProgressGauge, StoredValue, StressorConfig,
    StressorContext, SynchronizedStatistics,
};

pub fn make_ctx(config: StressorConfig) -> Arc<StressorContext> {
    Arc::new(StressorContext::new(config))
}

pub fn make_env(
    ctx: &Arc<StressorContext>,
    cache: Arc<dyn CacheBackend>,
    thread_id: i32,
) -> LogicEnv {
    LogicEnv {
        ctx: ctx.clone(),
        cache,
        stats: Arc::new(SynchronizedStatistics::new()),
        terminate: Arc::new(AtomicBool::new(false)),
        gauge: Arc::new(ProgressGauge::default()),
        thread_id,
    }
}

/// Everything a session did, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Get(String),
    Put(String),
    Remove(String),
    PutIfAbsent(String),
    Replace(String),
    RemoveExpected(String),
    TxStart,
    TxCommit,
    TxRollback,
}

/// Decorator recording every call before delegating to the wrapped session.
pub struct RecordingCache {
    inner: Arc<dyn CacheBackend>,
    events: Mutex<Vec<Event>>,
}

impl RecordingCache {
    pub fn new(inner: Arc<dyn CacheBackend>) -> Arc<Self> {
        Arc::new(RecordingCache {
            inner,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Keys of plain puts, in order.
    pub fn put_keys(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Put(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl CacheBackend for RecordingCache {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        self.record(Event::Get(key.to_string()));
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, value: StoredValue) -> Result<(), CacheError> {
        self.record(Event::Put(key.to_string()));
        self.inner.put(bucket, key, value).await
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        self.record(Event::Remove(key.to_string()));
        self.inner.remove(bucket, key).await
    }

    async fn start_transaction(&self) -> Result<(), CacheError> {
        self.record(Event::TxStart);
        self.inner.start_transaction().await
    }

    async fn end_transaction(&self, commit: bool) -> Result<(), CacheError> {
        self.record(if commit {
            Event::TxCommit
        } else {
            Event::TxRollback
        });
        self.inner.end_transaction(commit).await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        if self.inner.atomic_ops().is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl AtomicOps for RecordingCache {
    async fn put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: StoredValue,
    ) -> Result<Option<StoredValue>, CacheError> {
        self.record(Event::PutIfAbsent(key.to_string()));
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .put_if_absent(bucket, key, value)
            .await
    }

    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        old: &StoredValue,
        new: StoredValue,
    ) -> Result<bool, CacheError> {
        self.record(Event::Replace(key.to_string()));
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .replace(bucket, key, old, new)
            .await
    }

    async fn remove_expected(
        &self,
        bucket: &str,
        key: &str,
        expected: &StoredValue,
    ) -> Result<bool, CacheError> {
        self.record(Event::RemoveExpected(key.to_string()));
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .remove_expected(bucket, key, expected)
            .await
    }
}

/// Decorator that pretends a key is absent for the first `n` reads,
/// simulating the window where two workers race on the same fresh key.
pub struct StaleReadCache {
    inner: Arc<dyn CacheBackend>,
    stale_key: String,
    remaining: AtomicU32,
}

impl StaleReadCache {
    pub fn new(inner: Arc<dyn CacheBackend>, stale_key: &str, stale_reads: u32) -> Arc<Self> {
        Arc::new(StaleReadCache {
            inner,
            stale_key: stale_key.to_string(),
            remaining: AtomicU32::new(stale_reads),
        })
    }

    fn consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CacheBackend for StaleReadCache {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        if key == self.stale_key && self.consume() {
            return Ok(None);
        }
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: &str, value: StoredValue) -> Result<(), CacheError> {
        self.inner.put(bucket, key, value).await
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError> {
        self.inner.remove(bucket, key).await
    }

    async fn start_transaction(&self) -> Result<(), CacheError> {
        self.inner.start_transaction().await
    }

    async fn end_transaction(&self, commit: bool) -> Result<(), CacheError> {
        self.inner.end_transaction(commit).await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        if self.inner.atomic_ops().is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl AtomicOps for StaleReadCache {
    async fn put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: StoredValue,
    ) -> Result<Option<StoredValue>, CacheError> {
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .put_if_absent(bucket, key, value)
            .await
    }

    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        old: &StoredValue,
        new: StoredValue,
    ) -> Result<bool, CacheError> {
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .replace(bucket, key, old, new)
            .await
    }

    async fn remove_expected(
        &self,
        bucket: &str,
        key: &str,
        expected: &StoredValue,
    ) -> Result<bool, CacheError> {
        self.inner
            .atomic_ops()
            .expect("inner backend lost atomic capability")
            .remove_expected(bucket, key, expected)
            .await
    }
}
