//! Shared state machine of the log-based logics
//!
//! Owns the operation-id counter, the replayable key-selector RNG, the
//! transaction frame with its rollback snapshot, the delayed-remove queue and
//! the checker-synchronization protocol. The private/shared variants plug in
//! through [`LogProtocol`] and only decide how a single operation touches the
//! store.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, trace};

use super::{Logic, LogicEnv, LogicFault, WorkerError};
use crate::cache::is_cancellation;
use crate::keys::{checker_key, ignored_key, last_operation_key};
use crate::values::{LastOperation, Operation, StoredValue};
use crate::rng::ReplayableRng;

/// Pause between polls while waiting for checker progress.
pub(crate) const CHECKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A remove postponed until the transaction that wrote the value's new
/// location commits.
#[derive(Clone, Debug)]
pub(crate) struct DelayedRemove {
    pub key_id: i64,
    pub value: StoredValue,
}

/// Mutable state shared by all log-based logics.
pub struct LogState {
    pub(crate) env: LogicEnv,
    /// Monotone counter identifying each attempted operation. Advances only
    /// after a step fully succeeds; rollback rewinds it to the transaction
    /// snapshot.
    pub(crate) operation_id: i64,
    pub(crate) key_id: i64,
    pub(crate) rng: ReplayableRng,
    /// Keyed by the exact (signed) key id being removed.
    pub(crate) delayed_removes: HashMap<i64, DelayedRemove>,
    tx_start_operation_id: i64,
    tx_start_key_id: i64,
    tx_start_rng_state: u64,
    tx_rolled_back: bool,
    remaining_tx_ops: usize,
}

impl LogState {
    /// Build the state, resuming from the stressor checkpoint when one is
    /// stored. A missing or unreadable checkpoint falls back to `seed`.
    pub(crate) async fn recover(env: LogicEnv, seed: i64) -> Self {
        let transaction_size = env.ctx.config.transaction_size;
        let mut operation_id = 0;
        let mut rng = None;
        let checkpoint_key = last_operation_key(env.thread_id);
        match env.cache.get(env.bucket(), &checkpoint_key).await {
            Ok(Some(StoredValue::LastOp(last))) => {
                operation_id = last.operation_id + 1;
                rng = Some(ReplayableRng::restored(last.rng_state));
                debug!(
                    thread_id = env.thread_id,
                    operation_id, "restarting operations from checkpoint"
                );
            }
            Ok(Some(other)) => {
                error!(
                    key = %checkpoint_key,
                    found = other.type_name(),
                    "unexpected value at checkpoint key, reseeding"
                );
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "failure getting last operation");
            }
        }
        let rng = rng.unwrap_or_else(|| {
            trace!(seed, "initializing key selector from seed");
            ReplayableRng::seeded(seed)
        });
        LogState {
            env,
            operation_id,
            key_id: 0,
            rng,
            delayed_removes: HashMap::new(),
            tx_start_operation_id: 0,
            tx_start_key_id: -1,
            tx_start_rng_state: 0,
            tx_rolled_back: false,
            remaining_tx_ops: transaction_size,
        }
    }

    pub(crate) fn terminated(&self) -> bool {
        self.env.terminated()
    }

    pub(crate) fn thread_id(&self) -> i32 {
        self.env.thread_id
    }

    pub(crate) fn bucket(&self) -> &str {
        self.env.bucket()
    }

    pub(crate) fn generate_key(&self, key_id: i64) -> String {
        self.env.generate_key(key_id)
    }

    pub(crate) fn transaction_size(&self) -> usize {
        self.env.ctx.config.transaction_size
    }

    pub(crate) fn log_value_max_size(&self) -> usize {
        self.env.ctx.config.log_value_max_size
    }

    pub(crate) fn select_operation(&mut self) -> Operation {
        self.env.ctx.config.operation_mix.select(&mut self.rng)
    }

    /// Write the stressor checkpoint: current operation id plus the exact RNG
    /// state, so a restarted worker continues the identical sequence.
    pub(crate) async fn write_last_operation(&self) -> Result<(), crate::cache::CacheError> {
        let checkpoint = LastOperation::new(self.operation_id, self.rng.state());
        self.env
            .cache
            .put(
                self.bucket(),
                &last_operation_key(self.thread_id()),
                StoredValue::LastOp(checkpoint),
            )
            .await
    }

    /// Lowest operation id of `thread_id` every checker has certified.
    ///
    /// A checker whose slave is dead (and whose watermark lags behind
    /// `min_operation_id`) is bypassed when configured: its ignored floor is
    /// raised to `min_operation_id` and it counts as having certified up to
    /// there. Raising the floor inside a transaction signals `BreakTx` so the
    /// write becomes durable before the caller consumes its effect.
    pub(crate) async fn checked_operation_floor(
        &self,
        thread_id: i32,
        min_operation_id: i64,
    ) -> Result<i64, LogicFault> {
        let config = &self.env.ctx.config;
        let mut min_read = i64::MAX;
        for slave in 0..config.num_slaves {
            let watermark_key = checker_key(slave, thread_id);
            let watermark = self
                .env
                .cache
                .get(self.bucket(), &watermark_key)
                .await
                .map_err(|e| {
                    error!(slave, thread_id, error = %e, "cannot read last checked operation id");
                    LogicFault::Cache(e)
                })?;
            let read_operation_id = match watermark {
                None => i64::MIN,
                Some(StoredValue::LastOp(op)) => op.operation_id,
                Some(other) => {
                    return Err(LogicFault::Consistency(format!(
                        "checker watermark {} holds a {}, expected a last operation",
                        watermark_key,
                        other.type_name()
                    )));
                }
            };
            if read_operation_id < min_operation_id
                && config.ignore_dead_checkers
                && !self.env.ctx.liveness.is_slave_alive(slave)
            {
                let floor_key = ignored_key(slave, thread_id);
                let floor = match self.env.cache.get(self.bucket(), &floor_key).await? {
                    None => None,
                    Some(StoredValue::OpId(v)) => Some(v),
                    Some(other) => {
                        return Err(LogicFault::Consistency(format!(
                            "ignored floor {} holds a {}, expected an operation id",
                            floor_key,
                            other.type_name()
                        )));
                    }
                };
                if floor.map_or(true, |v| v < min_operation_id) {
                    debug!(
                        slave,
                        thread_id,
                        previous = ?floor,
                        floor = min_operation_id,
                        "raising ignored floor for dead checker"
                    );
                    self.env
                        .cache
                        .put(self.bucket(), &floor_key, StoredValue::OpId(min_operation_id))
                        .await?;
                    if config.transaction_size > 0 {
                        return Err(LogicFault::BreakTx);
                    }
                }
                min_read = min_read.min(min_operation_id);
            } else {
                min_read = min_read.min(read_operation_id);
            }
        }
        Ok(min_read)
    }

    /// Per-worker certified floors, for trimming shared log values.
    pub(crate) async fn checked_operations_floor(
        &self,
        min_operation_id: i64,
    ) -> Result<BTreeMap<i32, i64>, LogicFault> {
        let total = self.env.ctx.config.total_threads() as i32;
        let mut floors = BTreeMap::new();
        for thread in 0..total {
            floors.insert(
                thread,
                self.checked_operation_floor(thread, min_operation_id).await?,
            );
        }
        Ok(floors)
    }
}

/// The capability set a concrete log logic plugs into [`LogLogic`].
#[async_trait]
pub trait LogProtocol: Send + Sync {
    /// Short name for status strings and logs.
    fn name(&self) -> &'static str;

    /// Draw the key id the next operation targets.
    fn next_key_id(&mut self, state: &mut LogState) -> i64;

    /// Execute one operation against `key_id`.
    ///
    /// `Ok(false)` means the step cannot make progress right now (lost race,
    /// blocked on checker) and the same operation id must be retried.
    async fn invoke_logic(&mut self, state: &mut LogState, key_id: i64)
        -> Result<bool, LogicFault>;

    /// Remove `key_id`, verifying the removed value matches `expected`.
    async fn checked_remove(
        &self,
        state: &LogState,
        key_id: i64,
        expected: &StoredValue,
    ) -> Result<bool, LogicFault>;

    /// Queue removal of the old copy of a moved value.
    ///
    /// Outside transactions the remove happens immediately. Inside one it is
    /// recorded and executed only after the transaction that wrote the new
    /// copy commits. When the complementary entry is already queued the value
    /// has moved back within this transaction; both entries are dropped,
    /// since executing either remove could erase the surviving copy.
    async fn delayed_remove(
        &self,
        state: &mut LogState,
        key_id: i64,
        prev_value: StoredValue,
    ) -> Result<(), LogicFault> {
        if state.transaction_size() == 0 {
            self.checked_remove(state, key_id, &prev_value).await?;
            return Ok(());
        }
        if state.delayed_removes.remove(&!key_id).is_some() {
            return Ok(());
        }
        state
            .delayed_removes
            .insert(key_id, DelayedRemove { key_id, value: prev_value });
        Ok(())
    }
}

/// Log-based logic: the shared state machine instantiated with a protocol.
pub struct LogLogic<P: LogProtocol> {
    state: LogState,
    protocol: P,
}

impl<P: LogProtocol> LogLogic<P> {
    /// Build the logic, resuming from the stored checkpoint if present.
    pub async fn recover(protocol: P, env: LogicEnv, seed: i64) -> Self {
        LogLogic {
            state: LogState::recover(env, seed).await,
            protocol,
        }
    }

    pub fn operation_id(&self) -> i64 {
        self.state.operation_id
    }

    pub fn rng_state(&self) -> u64 {
        self.state.rng.state()
    }

    pub fn pending_delayed_removes(&self) -> usize {
        self.state.delayed_removes.len()
    }

    /// Lowest certified operation id across all checkers for `thread_id`.
    pub async fn checked_operation(
        &self,
        thread_id: i32,
        min_operation_id: i64,
    ) -> Result<i64, LogicFault> {
        self.state
            .checked_operation_floor(thread_id, min_operation_id)
            .await
    }

    /// Certified floors for every worker.
    pub async fn checked_operations(
        &self,
        min_operation_id: i64,
    ) -> Result<BTreeMap<i32, i64>, LogicFault> {
        self.state.checked_operations_floor(min_operation_id).await
    }

    // Returns true when the operation id is done and the counter may advance;
    // false retries the same id, replaying the whole transaction first if a
    // rollback is pending.
    async fn invoke_on(&mut self) -> Result<bool, WorkerError> {
        match self.try_invoke_on().await {
            Ok(done) => Ok(done),
            Err(LogicFault::Cancelled) => Err(WorkerError::Cancelled),
            Err(LogicFault::Consistency(msg)) => {
                error!(%msg, "consistency violation");
                Err(WorkerError::Consistency(msg))
            }
            Err(LogicFault::Unsupported(msg)) => Err(WorkerError::Config(msg)),
            Err(LogicFault::BreakTx) => {
                // break requests are consumed inside try_invoke_on; one
                // escaping means a protocol raised it outside a logic step
                error!("unexpected transaction break outside a logic step");
                Ok(false)
            }
            Err(LogicFault::Cache(e)) => {
                if is_cancellation(&e) {
                    return Err(WorkerError::Cancelled);
                }
                match &e {
                    crate::cache::CacheError::Suspect(msg) => {
                        error!(%msg, "request failed on a suspected member");
                    }
                    other => error!(error = %other, "cache operation error"),
                }
                if self.state.transaction_size() > 0 {
                    match self.state.env.cache.end_transaction(false).await {
                        Ok(()) => info!("transaction rolled back"),
                        Err(e1) => error!(error = %e1, "error while rolling back transaction"),
                    }
                    info!(
                        operation_id = self.state.tx_start_operation_id,
                        "restarting from transaction snapshot"
                    );
                    self.state.remaining_tx_ops = self.state.transaction_size();
                    self.state.tx_rolled_back = true;
                    self.state.delayed_removes.clear();
                }
                Ok(false)
            }
        }
    }

    async fn try_invoke_on(&mut self) -> Result<bool, LogicFault> {
        let transaction_size = self.state.transaction_size();
        if transaction_size > 0 && self.state.remaining_tx_ops == transaction_size {
            self.state.tx_start_operation_id = self.state.operation_id;
            self.state.tx_start_key_id = self.state.key_id;
            self.state.tx_start_rng_state = self.state.rng.state();
            self.state.env.cache.start_transaction().await?;
        }

        let mut tx_break_requested = false;
        let key_id = self.state.key_id;
        match self.protocol.invoke_logic(&mut self.state, key_id).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(LogicFault::BreakTx) => tx_break_requested = true,
            Err(other) => return Err(other),
        }
        self.state.env.gauge.record_success();

        // without transactions the checkpoint is written in-line, once in a
        // while
        if transaction_size == 0 {
            let period = self.state.env.ctx.config.log_counter_update_period;
            if period > 0 && self.state.operation_id % period == 0 {
                if let Err(e) = self.state.write_last_operation().await {
                    error!(error = %e, "error writing stressor checkpoint");
                }
            }
        }

        if transaction_size > 0 {
            self.state.remaining_tx_ops -= 1;
            if self.state.remaining_tx_ops == 0 || tx_break_requested {
                let committed = self.state.env.cache.end_transaction(true).await;
                self.state.remaining_tx_ops = transaction_size;
                if let Err(e) = committed {
                    trace!(
                        error = %e,
                        operation_id = self.state.tx_start_operation_id,
                        "transaction rolled back, restarting from snapshot"
                    );
                    self.state.tx_rolled_back = true;
                    self.state.delayed_removes.clear();
                    return Ok(false);
                }
                if self.state.terminated() {
                    // a commit may still have gone through under shutdown;
                    // removing entries now could erase data whose replacement
                    // write never became durable
                    info!("about to terminate, not executing delayed removes");
                    return Ok(false);
                }
                self.flush_delayed_removes().await?;
                if self.state.terminated() {
                    info!("about to terminate, not writing the checkpoint");
                    return Ok(false);
                }
                if tx_break_requested {
                    trace!(
                        operation_id = self.state.operation_id,
                        "transaction committed early, retrying operation"
                    );
                    return Ok(false);
                }
                if let Err(e) = self.write_checkpoint_transaction().await {
                    error!(error = %e, "cannot write stressor checkpoint");
                }
            }
        }
        Ok(true)
    }

    // Runs the queued removes in their own transaction, retrying until it
    // commits or termination is requested. Only consistency violations and
    // cancellation escape.
    async fn flush_delayed_removes(&mut self) -> Result<(), LogicFault> {
        if self.state.delayed_removes.is_empty() {
            return Ok(());
        }
        let mut in_transaction = false;
        while !self.state.terminated() {
            match self.try_flush_delayed_removes(&mut in_transaction).await {
                Ok(()) => return Ok(()),
                Err(LogicFault::Cancelled) => return Err(LogicFault::Cancelled),
                Err(LogicFault::Consistency(msg)) => return Err(LogicFault::Consistency(msg)),
                Err(LogicFault::Unsupported(msg)) => return Err(LogicFault::Unsupported(msg)),
                Err(LogicFault::Cache(e)) if is_cancellation(&e) => {
                    return Err(LogicFault::Cancelled);
                }
                Err(e) => {
                    error!(error = ?e, "error while executing delayed removes");
                }
            }
        }
        Ok(())
    }

    async fn try_flush_delayed_removes(
        &mut self,
        in_transaction: &mut bool,
    ) -> Result<(), LogicFault> {
        if *in_transaction {
            let _ = self.state.env.cache.end_transaction(false).await;
            *in_transaction = false;
        }
        self.state.env.cache.start_transaction().await?;
        *in_transaction = true;
        let removes: Vec<DelayedRemove> = self.state.delayed_removes.values().cloned().collect();
        for remove in removes {
            self.protocol
                .checked_remove(&self.state, remove.key_id, &remove.value)
                .await?;
        }
        self.state.env.cache.end_transaction(true).await?;
        *in_transaction = false;
        self.state.delayed_removes.clear();
        Ok(())
    }

    async fn write_checkpoint_transaction(&self) -> Result<(), crate::cache::CacheError> {
        self.state.env.cache.start_transaction().await?;
        if let Err(e) = self.state.write_last_operation().await {
            let _ = self.state.env.cache.end_transaction(false).await;
            return Err(e);
        }
        self.state.env.cache.end_transaction(true).await
    }
}

#[async_trait]
impl<P: LogProtocol> Logic for LogLogic<P> {
    async fn invoke(&mut self) -> Result<(), WorkerError> {
        let key_id = self.protocol.next_key_id(&mut self.state);
        self.state.key_id = key_id;
        loop {
            if self.state.tx_rolled_back {
                self.state.key_id = self.state.tx_start_key_id;
                self.state.operation_id = self.state.tx_start_operation_id;
                self.state.rng.set_state(self.state.tx_start_rng_state);
                self.state.tx_rolled_back = false;
            }
            trace!(
                operation_id = self.state.operation_id,
                key_id = self.state.key_id,
                "invoking operation"
            );
            self.state
                .env
                .gauge
                .update(self.state.operation_id, self.state.key_id);
            if self.invoke_on().await? {
                break;
            }
            if self.state.terminated() {
                break;
            }
        }
        self.state.operation_id += 1;
        Ok(())
    }
}
