//! Log logic for keys any worker may write
//!
//! Write races are resolved through the backend's conditional operations:
//! putIfAbsent for fresh keys, replace otherwise. The main and backup slots
//! can never be modified atomically together, so both holding a value is a
//! legal state that gets reconciled by joining; the invariant is only that
//! every operation id is recorded in at least one of the two.

use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::log_base::{LogProtocol, LogState, CHECKER_POLL_INTERVAL};
use super::LogicFault;
use crate::values::{Operation, SharedLogValue, StoredValue};

// After this many fruitless trim attempts the worker gives up and surfaces
// the stall instead of spinning forever on checkers that make no progress.
const STALLED_TRIM_LIMIT: usize = 600;

#[derive(Debug, Default)]
pub struct SharedLogLogic;

impl SharedLogLogic {
    pub fn new() -> Self {
        SharedLogLogic
    }

    async fn next_value(
        &self,
        state: &LogState,
        prev: Option<&SharedLogValue>,
        backup: Option<&SharedLogValue>,
    ) -> Result<Option<SharedLogValue>, LogicFault> {
        let thread_id = state.thread_id();
        let max_size = state.log_value_max_size();
        match (prev, backup) {
            (None, None) => Ok(Some(SharedLogValue::new(thread_id, state.operation_id))),
            (Some(prev), Some(backup)) => {
                let joined = prev.join(backup);
                if joined.size() >= max_size {
                    self.filter_and_add(state, joined).await
                } else {
                    Ok(Some(joined.with(thread_id, state.operation_id)))
                }
            }
            (Some(value), None) | (None, Some(value)) => {
                if value.size() < max_size {
                    Ok(Some(value.with(thread_id, state.operation_id)))
                } else {
                    self.filter_and_add(state, value.clone()).await
                }
            }
        }
    }

    // Trim every worker's certified prefix, then append our operation. None
    // when the value is still too large: the caller re-reads and retries,
    // hoping for checker progress in the meantime.
    async fn filter_and_add(
        &self,
        state: &LogState,
        value: SharedLogValue,
    ) -> Result<Option<SharedLogValue>, LogicFault> {
        let thread_id = state.thread_id();
        let floors = state
            .checked_operations_floor(value.min_from(thread_id))
            .await?;
        let filtered = value.with_filtered(thread_id, state.operation_id, &floors);
        if filtered.size() > state.log_value_max_size() {
            Ok(None)
        } else {
            Ok(Some(filtered))
        }
    }

    async fn checked_get(
        &self,
        state: &LogState,
        key_id: i64,
    ) -> Result<Option<SharedLogValue>, LogicFault> {
        let key = state.generate_key(key_id);
        let start = Instant::now();
        let value = match state.env.cache.get(state.bucket(), &key).await {
            Ok(value) => value,
            Err(e) => {
                state.env.stats.register_error(start.elapsed(), Operation::Get);
                return Err(e.into());
            }
        };
        let elapsed = start.elapsed();
        match value {
            None => {
                state.env.stats.register_request(elapsed, Operation::GetNull);
                Ok(None)
            }
            Some(StoredValue::Shared(value)) => {
                state.env.stats.register_request(elapsed, Operation::Get);
                Ok(Some(value))
            }
            Some(other) => {
                state.env.stats.register_error(elapsed, Operation::Get);
                Err(LogicFault::Consistency(format!(
                    "value at {} is a {}, expected a shared log value",
                    key,
                    other.type_name()
                )))
            }
        }
    }

    // Conditional write: putIfAbsent when no old value was read, replace
    // otherwise. False means the race was lost.
    async fn checked_put(
        &self,
        state: &LogState,
        key_id: i64,
        old: Option<&SharedLogValue>,
        new: SharedLogValue,
    ) -> Result<bool, LogicFault> {
        let Some(atomic) = state.env.cache.atomic_ops() else {
            return Err(LogicFault::Unsupported(
                "shared log logic requires a backend with atomic operations".into(),
            ));
        };
        let key = state.generate_key(key_id);
        let start = Instant::now();
        let result = match old {
            None => atomic
                .put_if_absent(state.bucket(), &key, StoredValue::Shared(new))
                .await
                .map(|prior| prior.is_none()),
            Some(old) => {
                let old = StoredValue::Shared(old.clone());
                atomic
                    .replace(state.bucket(), &key, &old, StoredValue::Shared(new))
                    .await
            }
        };
        match result {
            Ok(swapped) => {
                state.env.stats.register_request(start.elapsed(), Operation::Put);
                Ok(swapped)
            }
            Err(e) => {
                state.env.stats.register_error(start.elapsed(), Operation::Put);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl LogProtocol for SharedLogLogic {
    fn name(&self) -> &'static str {
        "shared-log"
    }

    fn next_key_id(&mut self, state: &mut LogState) -> i64 {
        let num_entries = state.env.ctx.config.num_entries;
        state.rng.next_below(num_entries as u64) as i64
    }

    async fn invoke_logic(
        &mut self,
        state: &mut LogState,
        key_id: i64,
    ) -> Result<bool, LogicFault> {
        let operation = state.select_operation();
        let mut stalls = 0;
        let (prev_value, backup_value, next_value) = loop {
            let prev = self.checked_get(state, key_id).await?;
            let backup = self.checked_get(state, !key_id).await?;
            let next = self.next_value(state, prev.as_ref(), backup.as_ref()).await?;
            if state.terminated() {
                return Ok(false);
            }
            match next {
                Some(next) => break (prev, backup, next),
                None => {
                    stalls += 1;
                    if stalls >= STALLED_TRIM_LIMIT {
                        return Err(LogicFault::Consistency(format!(
                            "checkers made no progress after {} attempts to trim key {}",
                            stalls, key_id
                        )));
                    }
                    tokio::time::sleep(CHECKER_POLL_INTERVAL).await;
                }
            }
        };
        match operation {
            Operation::Put => {
                if !self
                    .checked_put(state, key_id, prev_value.as_ref(), next_value)
                    .await?
                {
                    return Ok(false);
                }
                if let Some(backup) = backup_value {
                    self.delayed_remove(state, !key_id, StoredValue::Shared(backup))
                        .await?;
                }
                Ok(true)
            }
            // REMOVE records the operation in the backup slot
            Operation::Remove => {
                if !self
                    .checked_put(state, !key_id, backup_value.as_ref(), next_value)
                    .await?
                {
                    return Ok(false);
                }
                if let Some(prev) = prev_value {
                    self.delayed_remove(state, key_id, StoredValue::Shared(prev))
                        .await?;
                }
                Ok(true)
            }
            Operation::Get | Operation::GetNull => Err(LogicFault::Unsupported(
                "only PUT and REMOVE operations are allowed for log logics".into(),
            )),
        }
    }

    async fn checked_remove(
        &self,
        state: &LogState,
        key_id: i64,
        expected: &StoredValue,
    ) -> Result<bool, LogicFault> {
        let Some(atomic) = state.env.cache.atomic_ops() else {
            return Err(LogicFault::Unsupported(
                "shared log logic requires a backend with atomic operations".into(),
            ));
        };
        let key = state.generate_key(key_id);
        let start = Instant::now();
        match atomic.remove_expected(state.bucket(), &key, expected).await {
            Ok(removed) => {
                if !removed {
                    debug!(%key, "conditional remove lost a race, leaving the entry");
                }
                state
                    .env
                    .stats
                    .register_request(start.elapsed(), Operation::Remove);
                Ok(removed)
            }
            Err(e) => {
                state
                    .env
                    .stats
                    .register_error(start.elapsed(), Operation::Remove);
                Err(e.into())
            }
        }
    }
}
