//! Process-wide context and worker lifecycle management
//!
//! The context bundles configuration with the key generator and the liveness
//! oracle; workers treat it as read-only. The manager assigns key ranges,
//! spawns one task per worker and collects results and statistics on stop.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheBackend;
use crate::config::StressorConfig;
use crate::keys::{KeyGenerator, NumericKeyGenerator, Range};
use crate::liveness::{AllAlive, SlaveLiveness};
use crate::logic::WorkerError;
use crate::stats::StatsSnapshot;
use crate::worker::{StressorWorker, WorkerHandle};

/// Read-only environment shared by every worker of this process.
pub struct StressorContext {
    pub config: StressorConfig,
    pub key_generator: Arc<dyn KeyGenerator>,
    pub liveness: Arc<dyn SlaveLiveness>,
}

impl StressorContext {
    pub fn new(config: StressorConfig) -> Self {
        StressorContext {
            config,
            key_generator: Arc::new(NumericKeyGenerator),
            liveness: Arc::new(AllAlive),
        }
    }

    pub fn with_key_generator(mut self, key_generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn SlaveLiveness>) -> Self {
        self.liveness = liveness;
        self
    }
}

/// Spawns and controls the stressor workers of one slave.
pub struct StressorManager {
    ctx: Arc<StressorContext>,
    handles: Vec<WorkerHandle>,
    tasks: Vec<JoinHandle<Result<(), WorkerError>>>,
}

impl StressorManager {
    pub fn new(config: StressorConfig) -> Self {
        Self::with_context(StressorContext::new(config))
    }

    pub fn with_context(ctx: StressorContext) -> Self {
        StressorManager {
            ctx: Arc::new(ctx),
            handles: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn context(&self) -> &StressorContext {
        &self.ctx
    }

    /// Primary key range of local worker `idx`: the key domain divided over
    /// slaves, this slave's share divided over its workers.
    pub fn thread_range(&self, idx: usize) -> Range {
        let config = &self.ctx.config;
        let slave_range =
            Range::new(0, config.num_entries).split(config.num_slaves)[config.slave_index];
        slave_range.split(config.num_threads)[idx]
    }

    /// Ranges local worker `idx` inherits from dead slaves: each dead slave's
    /// share is divided evenly over all workers of the surviving slaves.
    pub fn dead_slave_ranges(&self, idx: usize) -> Vec<Range> {
        let config = &self.ctx.config;
        if config.dead_slave_indices.is_empty() {
            return Vec::new();
        }
        let slave_ranges = Range::new(0, config.num_entries).split(config.num_slaves);
        let live: Vec<usize> = (0..config.num_slaves)
            .filter(|slave| !config.dead_slave_indices.contains(slave))
            .collect();
        let Some(position) = live.iter().position(|&slave| slave == config.slave_index) else {
            return Vec::new();
        };
        let worker_slot = position * config.num_threads + idx;
        let total_workers = live.len() * config.num_threads;
        config
            .dead_slave_indices
            .iter()
            .map(|&dead| slave_ranges[dead].split(total_workers)[worker_slot])
            .filter(|range| range.size() > 0)
            .collect()
    }

    /// Build and spawn every worker. `session_factory` is called once per
    /// worker so each gets its own backend session.
    pub async fn start<F>(&mut self, mut session_factory: F) -> Result<(), WorkerError>
    where
        F: FnMut() -> Arc<dyn CacheBackend>,
    {
        for idx in 0..self.ctx.config.num_threads {
            let worker = StressorWorker::new(
                self.ctx.clone(),
                session_factory(),
                self.thread_range(idx),
                self.dead_slave_ranges(idx),
                idx,
            )
            .await?;
            debug!(status = %worker.status(), "starting stressor worker");
            self.handles.push(worker.handle());
            self.tasks.push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn request_terminate_all(&self) {
        for handle in &self.handles {
            handle.request_terminate();
        }
    }

    /// Wait until every worker finished its load phase.
    pub async fn wait_until_loaded(&self) {
        while !self.handles.iter().all(WorkerHandle::is_loaded) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Merged statistics across all workers.
    pub fn snapshot_stats(&self, reset: bool) -> StatsSnapshot {
        let mut merged = StatsSnapshot::empty();
        for handle in &self.handles {
            merged.merge(&handle.snapshot_stats(reset));
        }
        merged
    }

    /// Terminate everything and collect per-worker results.
    pub async fn stop(self) -> Vec<Result<(), WorkerError>> {
        self.request_terminate_all();
        join_all(self.tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(WorkerError::Join(e.to_string())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ranges_partition_domain() {
        let config = StressorConfig::default()
            .with_entries(100)
            .with_threads(3)
            .with_slaves(2, 0);
        let manager = StressorManager::new(config);
        let ranges: Vec<Range> = (0..3).map(|idx| manager.thread_range(idx)).collect();
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[2].end, 50);
        assert_eq!(ranges.iter().map(Range::size).sum::<i64>(), 50);
    }

    #[test]
    fn test_second_slave_gets_upper_half() {
        let config = StressorConfig::default()
            .with_entries(100)
            .with_threads(2)
            .with_slaves(2, 1);
        let manager = StressorManager::new(config);
        assert_eq!(manager.thread_range(0).start, 50);
        assert_eq!(manager.thread_range(1).end, 100);
    }

    #[test]
    fn test_dead_slave_ranges_spread_over_survivors() {
        let mut config = StressorConfig::default()
            .with_entries(90)
            .with_threads(2)
            .with_slaves(3, 0);
        config.dead_slave_indices = vec![1];
        let manager = StressorManager::new(config);

        // slave 1 owned [30, 60); four surviving workers split it
        let inherited: Vec<Range> = (0..2)
            .flat_map(|idx| manager.dead_slave_ranges(idx))
            .collect();
        assert!(inherited.iter().all(|r| r.start >= 30 && r.end <= 60));
        // this slave holds the first two of the four slots, 8 keys each
        assert_eq!(inherited.iter().map(Range::size).sum::<i64>(), 16);
    }

    #[test]
    fn test_no_dead_slaves_no_inherited_ranges() {
        let manager = StressorManager::new(StressorConfig::default());
        assert!(manager.dead_slave_ranges(0).is_empty());
    }
}
