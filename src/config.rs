//! Workload configuration

use std::time::Duration;

use crate::rng::ReplayableRng;
use crate::values::Operation;

/// Probability mix over GET/PUT/REMOVE for workload selection.
///
/// Weights need not sum to one; they are normalized at draw time. Log-based
/// logics must be configured without a GET share, since reads would leave
/// gaps in the recorded operation sequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OperationMix {
    pub gets: f64,
    pub puts: f64,
    pub removes: f64,
}

impl Default for OperationMix {
    fn default() -> Self {
        OperationMix {
            gets: 0.7,
            puts: 0.25,
            removes: 0.05,
        }
    }
}

impl OperationMix {
    /// PUT/REMOVE-only mix, the shape log-based logics require.
    pub fn put_remove(puts: f64, removes: f64) -> Self {
        OperationMix {
            gets: 0.0,
            puts,
            removes,
        }
    }

    pub fn put_only() -> Self {
        OperationMix {
            gets: 0.0,
            puts: 1.0,
            removes: 0.0,
        }
    }

    /// Map a uniform draw in `[0, 1)` to an operation kind.
    pub fn pick(&self, draw: f64) -> Operation {
        let total = self.gets + self.puts + self.removes;
        debug_assert!(total > 0.0, "operation mix must have positive weight");
        let scaled = draw * total;
        if scaled < self.gets {
            Operation::Get
        } else if scaled < self.gets + self.puts {
            Operation::Put
        } else {
            Operation::Remove
        }
    }

    pub fn select(&self, rng: &mut ReplayableRng) -> Operation {
        self.pick(rng.next_f64())
    }
}

/// All options recognized by the stressor core.
///
/// Builder-style `with_*` methods cover the knobs tests flip most often.
#[derive(Clone, Debug)]
pub struct StressorConfig {
    /// Stressor workers per slave.
    pub num_threads: usize,
    /// Number of slave processes participating in the run.
    pub num_slaves: usize,
    /// Index of this slave; global worker ids are
    /// `slave_index * num_threads + idx`.
    pub slave_index: usize,
    /// Size of the primary key domain.
    pub num_entries: i64,
    /// Payload size in bytes for the load phase and the legacy logic.
    pub entry_size: usize,
    /// Operations per transaction; zero disables transactions.
    pub transaction_size: usize,
    /// Pause between consecutive logic invocations.
    pub delay_between_requests: Duration,
    /// Run log-based logic instead of the legacy driver.
    pub use_log_values: bool,
    /// With log values, let any worker write any key (compare-and-swap mode).
    pub shared_keys: bool,
    /// Log length that triggers checker-driven trimming.
    pub log_value_max_size: usize,
    /// How often (in operations) the checkpoint is written when running
    /// without transactions.
    pub log_counter_update_period: i64,
    /// Bypass checkers whose slave is dead instead of waiting on them.
    pub ignore_dead_checkers: bool,
    /// Load phase uses conditional insert instead of plain put.
    pub load_with_put_if_absent: bool,
    /// Exit after the load phase.
    pub load_only: bool,
    pub operation_mix: OperationMix,
    /// Namespace passed to every cache call.
    pub bucket_id: String,
    /// Slaves whose key ranges this run inherits.
    pub dead_slave_indices: Vec<usize>,
}

impl Default for StressorConfig {
    fn default() -> Self {
        StressorConfig {
            num_threads: 2,
            num_slaves: 1,
            slave_index: 0,
            num_entries: 1024,
            entry_size: 1024,
            transaction_size: 0,
            delay_between_requests: Duration::ZERO,
            use_log_values: false,
            shared_keys: false,
            log_value_max_size: 100,
            log_counter_update_period: 50,
            ignore_dead_checkers: false,
            load_with_put_if_absent: false,
            load_only: false,
            operation_mix: OperationMix::default(),
            bucket_id: "stress".to_string(),
            dead_slave_indices: Vec::new(),
        }
    }
}

impl StressorConfig {
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_slaves(mut self, num_slaves: usize, slave_index: usize) -> Self {
        self.num_slaves = num_slaves;
        self.slave_index = slave_index;
        self
    }

    pub fn with_entries(mut self, num_entries: i64) -> Self {
        self.num_entries = num_entries;
        self
    }

    pub fn with_transaction_size(mut self, transaction_size: usize) -> Self {
        self.transaction_size = transaction_size;
        self
    }

    pub fn with_log_values(mut self, shared_keys: bool) -> Self {
        self.use_log_values = true;
        self.shared_keys = shared_keys;
        self
    }

    pub fn with_log_value_max_size(mut self, log_value_max_size: usize) -> Self {
        self.log_value_max_size = log_value_max_size;
        self
    }

    pub fn with_operation_mix(mut self, operation_mix: OperationMix) -> Self {
        self.operation_mix = operation_mix;
        self
    }

    pub fn with_ignore_dead_checkers(mut self, ignore: bool) -> Self {
        self.ignore_dead_checkers = ignore;
        self
    }

    /// Global worker id for a local thread index.
    pub fn global_thread_id(&self, idx: usize) -> i32 {
        (self.slave_index * self.num_threads + idx) as i32
    }

    /// Total worker count across all slaves.
    pub fn total_threads(&self) -> usize {
        self.num_threads * self.num_slaves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_pick_boundaries() {
        let mix = OperationMix {
            gets: 0.5,
            puts: 0.3,
            removes: 0.2,
        };
        assert_eq!(mix.pick(0.0), Operation::Get);
        assert_eq!(mix.pick(0.49), Operation::Get);
        assert_eq!(mix.pick(0.5), Operation::Put);
        assert_eq!(mix.pick(0.79), Operation::Put);
        assert_eq!(mix.pick(0.8), Operation::Remove);
        assert_eq!(mix.pick(0.999), Operation::Remove);
    }

    #[test]
    fn test_mix_normalizes_weights() {
        let mix = OperationMix {
            gets: 0.0,
            puts: 3.0,
            removes: 1.0,
        };
        assert_eq!(mix.pick(0.74), Operation::Put);
        assert_eq!(mix.pick(0.76), Operation::Remove);
    }

    #[test]
    fn test_put_only_never_draws_get() {
        let mix = OperationMix::put_only();
        let mut rng = ReplayableRng::seeded(1);
        for _ in 0..100 {
            assert_eq!(mix.select(&mut rng), Operation::Put);
        }
    }

    #[test]
    fn test_global_thread_id() {
        let config = StressorConfig::default().with_threads(4).with_slaves(3, 2);
        assert_eq!(config.global_thread_id(0), 8);
        assert_eq!(config.global_thread_id(3), 11);
        assert_eq!(config.total_threads(), 12);
    }
}
