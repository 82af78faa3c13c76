//! Cache backend contract consumed by the stressor core
//!
//! Each worker owns one backend session. Sessions of the same backend share
//! the underlying store, but transaction state is per session, mirroring how
//! distributed cache clients bind transactions to the calling context.

use async_trait::async_trait;
use thiserror::Error;

use crate::values::StoredValue;

/// Failures surfaced by backend operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The operation was interrupted by shutdown. Never treated as a fault.
    #[error("operation cancelled")]
    Cancelled,
    /// A cluster member was suspected of failure mid-operation. Retryable,
    /// logged with less noise than ordinary faults.
    #[error("member suspected: {0}")]
    Suspect(String),
    /// Any other backend failure. Retryable unless cancellation hides in the
    /// source chain.
    #[error("backend failure: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        CacheError::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_caused_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CacheError::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Longest cause chain `is_cancellation` will walk. Bounds the traversal so
/// an adversarial cyclic chain cannot loop forever.
const MAX_CAUSE_DEPTH: usize = 16;

/// True when a cancellation hides anywhere in the error's cause chain.
///
/// Backends wrap errors freely, so a worker interrupted inside a blocking
/// call may see the cancellation buried several sources deep.
pub fn is_cancellation(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    for _ in 0..MAX_CAUSE_DEPTH {
        match current {
            None => return false,
            Some(e) => {
                if matches!(e.downcast_ref::<CacheError>(), Some(CacheError::Cancelled)) {
                    return true;
                }
                current = e.source();
            }
        }
    }
    false
}

/// Core capability set of a key-value backend session.
///
/// `bucket` is an opaque namespace passed through on every call. Values are
/// compared structurally; backends that compare encoded bytes must use the
/// canonical encoding of [`StoredValue`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError>;

    async fn put(&self, bucket: &str, key: &str, value: StoredValue) -> Result<(), CacheError>;

    /// Remove the entry, returning the prior value if any.
    async fn remove(&self, bucket: &str, key: &str) -> Result<Option<StoredValue>, CacheError>;

    async fn start_transaction(&self) -> Result<(), CacheError>;

    /// Commit (`true`) or roll back (`false`) the session's open transaction.
    async fn end_transaction(&self, commit: bool) -> Result<(), CacheError>;

    fn is_running(&self) -> bool;

    /// Conditional-operation capability, when the backend has one.
    fn atomic_ops(&self) -> Option<&dyn AtomicOps> {
        None
    }
}

/// Compare-and-swap style conditional operations.
#[async_trait]
pub trait AtomicOps: Send + Sync {
    /// Insert only when absent; returns the prior value on conflict.
    async fn put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: StoredValue,
    ) -> Result<Option<StoredValue>, CacheError>;

    /// Replace only when the current value equals `old`.
    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        old: &StoredValue,
        new: StoredValue,
    ) -> Result<bool, CacheError>;

    /// Remove only when the current value equals `expected`.
    async fn remove_expected(
        &self,
        bucket: &str,
        key: &str,
        expected: &StoredValue,
    ) -> Result<bool, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_detected_at_top_level() {
        assert!(is_cancellation(&CacheError::Cancelled));
        assert!(!is_cancellation(&CacheError::backend("boom")));
        assert!(!is_cancellation(&CacheError::Suspect("node 3".into())));
    }

    #[test]
    fn test_cancellation_detected_in_nested_chain() {
        let inner = CacheError::backend_caused_by("connection reset", CacheError::Cancelled);
        let outer = CacheError::backend_caused_by("commit failed", inner);
        assert!(is_cancellation(&outer));
    }

    #[test]
    fn test_unrelated_chain_is_not_cancellation() {
        let inner = CacheError::backend_caused_by("io error", CacheError::backend("disk"));
        assert!(!is_cancellation(&inner));
    }
}
