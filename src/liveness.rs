//! Liveness oracle for checker processes
//!
//! Consulted only when the dead-checker bypass is enabled: a stressor blocked
//! on a checker that will never advance asks this oracle whether the checker's
//! slave is still alive before declaring its operations ignored.

use std::collections::HashSet;

use parking_lot::RwLock;

/// Answers whether the checker running on a given slave is alive.
pub trait SlaveLiveness: Send + Sync {
    fn is_slave_alive(&self, slave_index: usize) -> bool;
}

/// Oracle that considers every slave alive. The default when no external
/// membership source is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllAlive;

impl SlaveLiveness for AllAlive {
    fn is_slave_alive(&self, _slave_index: usize) -> bool {
        true
    }
}

/// Oracle backed by an explicit dead set. Useful in tests and in harnesses
/// that learn about node loss out of band.
#[derive(Debug, Default)]
pub struct StaticLiveness {
    dead: RwLock<HashSet<usize>>,
}

impl StaticLiveness {
    pub fn new() -> Self {
        StaticLiveness::default()
    }

    pub fn mark_dead(&self, slave_index: usize) {
        self.dead.write().insert(slave_index);
    }

    pub fn mark_alive(&self, slave_index: usize) {
        self.dead.write().remove(&slave_index);
    }
}

impl SlaveLiveness for StaticLiveness {
    fn is_slave_alive(&self, slave_index: usize) -> bool {
        !self.dead.read().contains(&slave_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_alive() {
        assert!(AllAlive.is_slave_alive(0));
        assert!(AllAlive.is_slave_alive(100));
    }

    #[test]
    fn test_static_liveness_toggles() {
        let oracle = StaticLiveness::new();
        assert!(oracle.is_slave_alive(3));
        oracle.mark_dead(3);
        assert!(!oracle.is_slave_alive(3));
        assert!(oracle.is_slave_alive(2));
        oracle.mark_alive(3);
        assert!(oracle.is_slave_alive(3));
    }
}
