//! Workload logics driven by stressor workers
//!
//! A logic performs one operation per [`invoke`](Logic::invoke) call. The
//! legacy logic is a plain sequential driver; the log-based logics record
//! every operation inside the stored values so an external checker can prove
//! none was lost or duplicated.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::RngCore;
use thiserror::Error;

use crate::cache::{CacheBackend, CacheError};
use crate::manager::StressorContext;
use crate::stats::SynchronizedStatistics;

pub mod legacy;
pub mod log_base;
pub mod private_log;
pub mod shared_log;

pub use legacy::LegacyLogic;
pub use log_base::{LogLogic, LogProtocol};
pub use private_log::PrivateLogLogic;
pub use shared_log::SharedLogLogic;

/// Failures that end a worker. Anything else is handled inside the logics by
/// rollback and retry; the stressor's purpose is to keep running through
/// faults and let the checker judge correctness afterwards.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Shutdown was requested. Clean termination, never a fault.
    #[error("worker cancelled")]
    Cancelled,
    /// Stored data had an unexpected shape. The one error a worker must not
    /// mask.
    #[error("consistency violation: {0}")]
    Consistency(String),
    #[error("configuration error: {0}")]
    Config(String),
    /// A worker task ended without producing a result.
    #[error("worker task join error: {0}")]
    Join(String),
}

/// Signal channel internal to the log-based logics.
///
/// `BreakTx` is deliberately a variant here rather than an error type of its
/// own: "commit now and retry this operation id in a fresh transaction" is
/// control flow and must never travel through the fault path.
#[derive(Debug)]
pub enum LogicFault {
    /// Commit the open transaction immediately, then retry the current
    /// operation id in a new transaction.
    BreakTx,
    Cancelled,
    /// Retryable backend failure.
    Cache(CacheError),
    /// Fatal: stored data does not match the expected shape.
    Consistency(String),
    /// Fatal: the configuration asked for an operation this logic cannot
    /// perform.
    Unsupported(String),
}

impl From<CacheError> for LogicFault {
    fn from(e: CacheError) -> Self {
        LogicFault::Cache(e)
    }
}

/// One workload step.
#[async_trait]
pub trait Logic: Send + Sync {
    async fn invoke(&mut self) -> Result<(), WorkerError>;
}

/// Live progress counters a logic publishes for its worker handle.
#[derive(Debug, Default)]
pub struct ProgressGauge {
    operation_id: AtomicI64,
    key_id: AtomicI64,
    last_success_epoch_ms: AtomicU64,
}

impl ProgressGauge {
    pub fn update(&self, operation_id: i64, key_id: i64) {
        self.operation_id.store(operation_id, Ordering::Relaxed);
        self.key_id.store(key_id, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_success_epoch_ms.store(now, Ordering::Relaxed);
    }

    pub fn operation_id(&self) -> i64 {
        self.operation_id.load(Ordering::Relaxed)
    }

    pub fn key_id(&self) -> i64 {
        self.key_id.load(Ordering::Relaxed)
    }

    /// Epoch milliseconds of the last successful operation, if any yet.
    pub fn last_success_epoch_ms(&self) -> Option<u64> {
        match self.last_success_epoch_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

/// Everything a logic borrows from its surrounding worker.
#[derive(Clone)]
pub struct LogicEnv {
    pub ctx: Arc<StressorContext>,
    pub cache: Arc<dyn CacheBackend>,
    pub stats: Arc<SynchronizedStatistics>,
    pub terminate: Arc<AtomicBool>,
    pub gauge: Arc<ProgressGauge>,
    /// Global worker id, unique across slaves.
    pub thread_id: i32,
}

impl LogicEnv {
    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn bucket(&self) -> &str {
        &self.ctx.config.bucket_id
    }

    pub fn generate_key(&self, key_id: i64) -> String {
        self.ctx.key_generator.generate_key(key_id)
    }
}

pub(crate) fn random_payload(rng: &mut impl RngCore, size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rng.fill_bytes(&mut payload);
    payload
}
