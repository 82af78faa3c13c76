//! Log logic for keys written by exactly one worker
//!
//! Each key in the worker's range is only ever modified by that worker, so
//! plain read-modify-write suffices. A PUT appends the operation id to the
//! value at the key; a REMOVE moves the extended value into the backup slot
//! `!key` and queues removal of the original. Reads are forbidden: every
//! operation id must land in some stored value or the checker would see a
//! gap.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, trace};

use super::log_base::{LogProtocol, LogState, CHECKER_POLL_INTERVAL};
use super::LogicFault;
use crate::cache::is_cancellation;
use crate::keys::Range;
use crate::values::{Operation, PrivateLogValue, StoredValue};

pub struct PrivateLogLogic {
    range: Range,
}

impl PrivateLogLogic {
    /// Logic over the worker's assigned key range.
    pub fn new(range: Range) -> Self {
        debug_assert!(range.size() > 0);
        PrivateLogLogic { range }
    }

    /// Extend `prev` with the current operation id, shifting off the prefix
    /// the checkers have already certified once the value is full. Blocks
    /// polling checker progress; `Ok(None)` means the caller should give up
    /// this attempt (termination or unreadable checker state).
    async fn next_value(
        &self,
        state: &mut LogState,
        prev: &PrivateLogValue,
    ) -> Result<Option<PrivateLogValue>, LogicFault> {
        if prev.size() < state.log_value_max_size() {
            return Ok(Some(prev.with(state.operation_id)));
        }
        let thread_id = state.thread_id();
        loop {
            if state.terminated() {
                return Ok(None);
            }
            let min_checked = match state
                .checked_operation_floor(thread_id, prev.operation_id(0))
                .await
            {
                Ok(floor) => floor,
                Err(LogicFault::Cache(e)) => {
                    if is_cancellation(&e) {
                        return Err(LogicFault::Cancelled);
                    }
                    error!(error = %e, "cannot read checker progress");
                    return Ok(None);
                }
                Err(other) => return Err(other),
            };
            if prev.operation_id(0) <= min_checked {
                let mut certified = 1;
                while certified < prev.size() && prev.operation_id(certified) <= min_checked {
                    trace!(
                        operation_id = prev.operation_id(certified),
                        min_checked,
                        "discarding certified operation"
                    );
                    certified += 1;
                }
                return Ok(Some(prev.shift(certified, state.operation_id)));
            }
            tokio::time::sleep(CHECKER_POLL_INTERVAL).await;
        }
    }

    // A key queued for delayed removal reads as absent: the value has already
    // moved to its complement within this transaction.
    async fn checked_get(
        &self,
        state: &LogState,
        key_id: i64,
    ) -> Result<Option<PrivateLogValue>, LogicFault> {
        if state.delayed_removes.contains_key(&key_id) {
            return Ok(None);
        }
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
            Some(StoredValue::Private(value)) => {
                state.env.stats.register_request(elapsed, Operation::Get);
                Ok(Some(value))
            }
            Some(other) => {
                state.env.stats.register_error(elapsed, Operation::Get);
                Err(LogicFault::Consistency(format!(
                    "value at {} is a {}, expected a private log value",
                    key,
                    other.type_name()
                )))
            }
        }
    }

    async fn checked_put(
        &self,
        state: &LogState,
        key_id: i64,
        value: PrivateLogValue,
    ) -> Result<(), LogicFault> {
        let key = state.generate_key(key_id);
        let start = Instant::now();
        match state
            .env
            .cache
            .put(state.bucket(), &key, StoredValue::Private(value))
            .await
        {
            Ok(()) => {
                state.env.stats.register_request(start.elapsed(), Operation::Put);
                Ok(())
            }
            Err(e) => {
                state.env.stats.register_error(start.elapsed(), Operation::Put);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl LogProtocol for PrivateLogLogic {
    fn name(&self) -> &'static str {
        "private-log"
    }

    fn next_key_id(&mut self, state: &mut LogState) -> i64 {
        self.range.start + state.rng.next_below(self.range.size() as u64) as i64
    }

    async fn invoke_logic(
        &mut self,
        state: &mut LogState,
        key_id: i64,
    ) -> Result<bool, LogicFault> {
        let operation = state.select_operation();
        let prev_value = self.checked_get(state, key_id).await?;
        match (prev_value, operation) {
            // an absent value may be mid-move; whatever was drawn, restore it
            // from the backup (or start fresh) and write it to the main key
            (None, _) => {
                let backup_value = self.checked_get(state, !key_id).await?;
                let next_value = match &backup_value {
                    None => Some(PrivateLogValue::new(state.thread_id(), state.operation_id)),
                    Some(backup) => self.next_value(state, backup).await?,
                };
                let Some(next_value) = next_value else {
                    return Ok(false);
                };
                self.checked_put(state, key_id, next_value).await?;
                if let Some(backup) = backup_value {
                    self.delayed_remove(state, !key_id, StoredValue::Private(backup))
                        .await?;
                }
                Ok(true)
            }
            (Some(prev), Operation::Put) => {
                let Some(next_value) = self.next_value(state, &prev).await? else {
                    return Ok(false);
                };
                self.checked_put(state, key_id, next_value).await?;
                Ok(true)
            }
            // REMOVE moves the extended value into the backup slot
            (Some(prev), Operation::Remove) => {
                let Some(next_value) = self.next_value(state, &prev).await? else {
                    return Ok(false);
                };
                self.checked_put(state, !key_id, next_value).await?;
                self.delayed_remove(state, key_id, StoredValue::Private(prev))
                    .await?;
                Ok(true)
            }
            (Some(_), Operation::Get | Operation::GetNull) => Err(LogicFault::Unsupported(
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
        let key = state.generate_key(key_id);
        let start = Instant::now();
        let prior = match state.env.cache.remove(state.bucket(), &key).await {
            Ok(prior) => prior,
            Err(e) => {
                state
                    .env
                    .stats
                    .register_error(start.elapsed(), Operation::Remove);
                return Err(e.into());
            }
        };
        let elapsed = start.elapsed();
        if prior.as_ref() == Some(expected) {
            state.env.stats.register_request(elapsed, Operation::Remove);
            Ok(true)
        } else {
            state.env.stats.register_error(elapsed, Operation::Remove);
            error!(%key, expected = ?expected, found = ?prior, "removed value does not match");
            Err(LogicFault::Consistency(format!(
                "expected to remove {:?} at {}, found {:?}",
                expected, key, prior
            )))
        }
    }
}
