//! Sequential GET/PUT/REMOVE driver without operation logs
//!
//! Rotates a cursor over the worker's key range and issues one operation per
//! invocation, drawn from the configured mix. No retry replay and no log
//! semantics; failures are counted and, under transactions, rolled back.

use std::time::Instant;

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::error;

use super::{random_payload, Logic, LogicEnv, WorkerError};
use crate::cache::{is_cancellation, CacheError};
use crate::keys::Range;
use crate::values::{Operation, StoredValue};

pub struct LegacyLogic {
    env: LogicEnv,
    rng: SmallRng,
    range: Range,
    current_key: i64,
    remaining_tx_ops: usize,
    invocations: i64,
}

impl LegacyLogic {
    pub fn new(env: LogicEnv, range: Range) -> Self {
        let remaining_tx_ops = env.ctx.config.transaction_size;
        LegacyLogic {
            rng: SmallRng::from_os_rng(),
            range,
            current_key: range.start,
            remaining_tx_ops,
            invocations: 0,
            env,
        }
    }

    async fn perform(
        &mut self,
        operation: Operation,
        key: &str,
        started: &mut Option<Instant>,
    ) -> Result<Operation, CacheError> {
        let transaction_size = self.env.ctx.config.transaction_size;
        if transaction_size > 0 && self.remaining_tx_ops == transaction_size {
            self.env.cache.start_transaction().await?;
        }
        *started = Some(Instant::now());
        match operation {
            Operation::Get | Operation::GetNull => {
                let value = self.env.cache.get(self.env.bucket(), key).await?;
                // a read that found nothing is accounted separately
                Ok(if value.is_none() {
                    Operation::GetNull
                } else {
                    Operation::Get
                })
            }
            Operation::Put => {
                let payload = random_payload(&mut self.rng, self.env.ctx.config.entry_size);
                self.env
                    .cache
                    .put(self.env.bucket(), key, StoredValue::Bytes(payload))
                    .await?;
                Ok(Operation::Put)
            }
            Operation::Remove => {
                self.env.cache.remove(self.env.bucket(), key).await?;
                Ok(Operation::Remove)
            }
        }
    }

    async fn handle_failure(
        &mut self,
        error: CacheError,
        operation: Operation,
        started: Option<Instant>,
    ) -> Result<(), WorkerError> {
        if is_cancellation(&error) {
            return Err(WorkerError::Cancelled);
        }
        match &error {
            CacheError::Suspect(msg) => error!(%msg, "request failed on a suspected member"),
            other => error!(error = %other, "cache operation error"),
        }
        let transaction_size = self.env.ctx.config.transaction_size;
        if transaction_size > 0 {
            if let Err(e) = self.env.cache.end_transaction(false).await {
                error!(error = %e, "error while ending transaction");
            }
            self.remaining_tx_ops = transaction_size;
        }
        self.env
            .stats
            .register_error(started.map(|s| s.elapsed()).unwrap_or_default(), operation);
        Ok(())
    }
}

#[async_trait]
impl Logic for LegacyLogic {
    async fn invoke(&mut self) -> Result<(), WorkerError> {
        let operation = self.env.ctx.config.operation_mix.pick(self.rng.random());
        let key_id = self.current_key;
        self.current_key += 1;
        if self.current_key == self.range.end {
            self.current_key = self.range.start;
        }
        self.invocations += 1;
        self.env.gauge.update(self.invocations, key_id);
        let key = self.env.generate_key(key_id);

        let mut started = None;
        match self.perform(operation, &key, &mut started).await {
            Ok(actual) => {
                self.env
                    .stats
                    .register_request(started.map(|s| s.elapsed()).unwrap_or_default(), actual);
                self.env.gauge.record_success();
                let transaction_size = self.env.ctx.config.transaction_size;
                if transaction_size > 0 {
                    self.remaining_tx_ops -= 1;
                    if self.remaining_tx_ops == 0 {
                        if let Err(e) = self.env.cache.end_transaction(true).await {
                            return self.handle_failure(e, operation, started).await;
                        }
                        self.remaining_tx_ops = transaction_size;
                    }
                }
                Ok(())
            }
            Err(e) => self.handle_failure(e, operation, started).await,
        }
    }
}
