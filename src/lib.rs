//! Background workload generator for distributed key-value stores
//!
//! Stressor workers continuously issue PUT/REMOVE operations against a keyed
//! store while maintaining, inside the stored values themselves, a
//! tamper-evident log of the operations performed. An external checker scans
//! those logs and proves every operation was observed exactly once; this
//! crate provides the workers, the log-value algebra, the transactional
//! retry/rollback protocol and the backend contract they run against.

pub mod cache;
pub mod config;
pub mod keys;
pub mod liveness;
pub mod logic;
pub mod manager;
pub mod rng;
pub mod stats;
pub mod values;
pub mod worker;

pub use cache::{AtomicOps, CacheBackend, CacheError, InMemoryCache, InMemorySession};
pub use config::{OperationMix, StressorConfig};
pub use keys::{KeyGenerator, NumericKeyGenerator, Range};
pub use liveness::{AllAlive, SlaveLiveness, StaticLiveness};
pub use logic::{
    LegacyLogic, Logic, LogicEnv, LogicFault, LogLogic, PrivateLogLogic, ProgressGauge,
    SharedLogLogic, WorkerError,
};
pub use manager::{StressorContext, StressorManager};
pub use rng::ReplayableRng;
pub use stats::{RequestStats, StatsSnapshot, SynchronizedStatistics};
pub use values::{LastOperation, Operation, PrivateLogValue, SharedLogValue, StoredValue};
pub use worker::{StressorWorker, WorkerHandle};
