//! Stressor worker: load phase plus the operation loop
//!
//! One worker per task, each with its own backend session, statistics and
//! logic state. Workers coordinate only through the cache; there is no
//! in-process synchronization between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, error, info, trace};

use crate::cache::{is_cancellation, CacheBackend};
use crate::keys::Range;
use crate::logic::{
    random_payload, LegacyLogic, Logic, LogLogic, LogicEnv, LogProtocol, PrivateLogLogic,
    ProgressGauge, SharedLogLogic, WorkerError,
};
use crate::manager::StressorContext;
use crate::stats::{StatsSnapshot, SynchronizedStatistics};
use crate::values::StoredValue;

/// A single stressor worker. Construct with [`StressorWorker::new`], grab a
/// [`handle`](StressorWorker::handle) for external control, then hand the
/// worker to [`run`](StressorWorker::run).
pub struct StressorWorker {
    env: LogicEnv,
    logic: Box<dyn Logic>,
    logic_name: &'static str,
    range: Range,
    dead_slave_ranges: Vec<Range>,
    idx: usize,
    loaded: Arc<AtomicBool>,
}

impl StressorWorker {
    /// Build a worker bound to its primary key range and any ranges inherited
    /// from dead slaves. Log-based logics resume from their stored checkpoint
    /// here, which is why construction is asynchronous.
    pub async fn new(
        ctx: Arc<StressorContext>,
        cache: Arc<dyn CacheBackend>,
        range: Range,
        dead_slave_ranges: Vec<Range>,
        idx: usize,
    ) -> Result<Self, WorkerError> {
        let thread_id = ctx.config.global_thread_id(idx);
        let env = LogicEnv {
            ctx: ctx.clone(),
            cache,
            stats: Arc::new(SynchronizedStatistics::new()),
            terminate: Arc::new(AtomicBool::new(false)),
            gauge: Arc::new(ProgressGauge::default()),
            thread_id,
        };
        let (logic, logic_name): (Box<dyn Logic>, &'static str) = if ctx.config.use_log_values {
            if ctx.config.shared_keys {
                if env.cache.atomic_ops().is_none() {
                    return Err(WorkerError::Config(
                        "shared log logic requires a backend with atomic operations".into(),
                    ));
                }
                let protocol = SharedLogLogic::new();
                let name = protocol.name();
                let logic = LogLogic::recover(protocol, env.clone(), thread_id as i64).await;
                (Box::new(logic), name)
            } else {
                let protocol = PrivateLogLogic::new(range);
                let name = protocol.name();
                let logic = LogLogic::recover(protocol, env.clone(), thread_id as i64).await;
                (Box::new(logic), name)
            }
        } else {
            (Box::new(LegacyLogic::new(env.clone(), range)), "legacy")
        };
        Ok(StressorWorker {
            env,
            logic,
            logic_name,
            range,
            dead_slave_ranges,
            idx,
            loaded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Control handle that stays valid after the worker moves into its task.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            terminate: self.env.terminate.clone(),
            loaded: self.loaded.clone(),
            stats: self.env.stats.clone(),
            gauge: self.env.gauge.clone(),
            thread_id: self.env.thread_id,
            idx: self.idx,
            logic_name: self.logic_name,
        }
    }

    pub fn request_terminate(&self) {
        self.env.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Mark the key range as already populated, skipping the load phase.
    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn snapshot_stats(&self, reset: bool) -> StatsSnapshot {
        self.env.stats.snapshot(reset)
    }

    pub fn status(&self) -> String {
        self.handle().status()
    }

    /// Drive the worker until termination. Cancellation is a clean exit; any
    /// transaction left open is rolled back best-effort on the way out.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        match self.drive().await {
            Ok(()) => {
                if self.env.ctx.config.transaction_size > 0 {
                    self.rollback_open_transaction().await;
                }
                Ok(())
            }
            Err(WorkerError::Cancelled) => {
                trace!(thread_id = self.env.thread_id, "stressor cancelled");
                if self.env.ctx.config.transaction_size > 0 {
                    self.rollback_open_transaction().await;
                }
                Ok(())
            }
            Err(e) => {
                error!(thread_id = self.env.thread_id, error = %e, "stressor failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), WorkerError> {
        if !self.is_loaded() {
            self.load_data().await?;
        }
        if self.env.ctx.config.load_only {
            info!("the stressor has finished loading data and will terminate");
            return Ok(());
        }
        let delay = self.env.ctx.config.delay_between_requests;
        while !self.env.terminated() {
            self.logic.invoke().await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn rollback_open_transaction(&self) {
        if self.env.cache.is_running() {
            if let Err(e) = self.env.cache.end_transaction(false).await {
                error!(error = %e, "error while ending transaction");
            }
        }
    }

    async fn load_data(&mut self) -> Result<(), WorkerError> {
        trace!(
            start = self.range.start,
            end = self.range.end,
            "loading key range"
        );
        self.load_key_range(self.range).await?;
        for range in self.dead_slave_ranges.clone() {
            trace!(
                start = range.start,
                end = range.end,
                "loading key range of a dead slave"
            );
            self.load_key_range(range).await?;
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    // Populates one range, retrying each key until it sticks. Only missing
    // atomic capability and cancellation abort the load.
    async fn load_key_range(&mut self, range: Range) -> Result<(), WorkerError> {
        let load_with_put_if_absent = self.env.ctx.config.load_with_put_if_absent;
        let entry_size = self.env.ctx.config.entry_size;
        if load_with_put_if_absent && self.env.cache.atomic_ops().is_none() {
            return Err(WorkerError::Config(
                "this cache backend does not support atomic operations".into(),
            ));
        }
        let mut rng = SmallRng::from_os_rng();
        let total = range.size();
        let mut loaded_keys = 0i64;
        let mut key_id = range.start;
        while key_id < range.end && !self.env.terminated() {
            loop {
                if self.env.terminated() {
                    return Ok(());
                }
                let key = self.env.generate_key(key_id);
                let payload = StoredValue::Bytes(random_payload(&mut rng, entry_size));
                let attempt = if load_with_put_if_absent {
                    let Some(atomic) = self.env.cache.atomic_ops() else {
                        return Err(WorkerError::Config(
                            "this cache backend does not support atomic operations".into(),
                        ));
                    };
                    atomic
                        .put_if_absent(self.env.bucket(), &key, payload)
                        .await
                        .map(|_| ())
                } else {
                    self.env.cache.put(self.env.bucket(), &key, payload).await
                };
                match attempt {
                    Ok(()) => {
                        if loaded_keys % 1000 == 0 {
                            debug!(loaded = loaded_keys, total, "loading entries");
                        }
                        break;
                    }
                    Err(e) if is_cancellation(&e) => return Err(WorkerError::Cancelled),
                    // any other failure is retried on the same key
                    Err(e) => error!(error = %e, "error while loading data"),
                }
            }
            key_id += 1;
            loaded_keys += 1;
        }
        debug!(total, "loaded all keys");
        Ok(())
    }
}

/// Cloneable view onto a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    terminate: Arc<AtomicBool>,
    loaded: Arc<AtomicBool>,
    stats: Arc<SynchronizedStatistics>,
    gauge: Arc<ProgressGauge>,
    thread_id: i32,
    idx: usize,
    logic_name: &'static str,
}

impl WorkerHandle {
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    pub fn snapshot_stats(&self, reset: bool) -> StatsSnapshot {
        self.stats.snapshot(reset)
    }

    pub fn status(&self) -> String {
        let last_success = match self.gauge.last_success_epoch_ms() {
            Some(ms) => format!(", lastSuccessMs={}", ms),
            None => String::new(),
        };
        format!(
            "StressorWorker-{} [id={}, terminated={}]: {} [operation={}, key={}{}]",
            self.idx,
            self.thread_id,
            self.terminate.load(Ordering::SeqCst),
            self.logic_name,
            self.gauge.operation_id(),
            self.gauge.key_id(),
            last_success
        )
    }
}
