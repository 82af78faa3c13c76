//! Stored value types carrying tamper-evident operation logs
//!
//! Every mutation a stressor performs is recorded inside the value it writes,
//! as an ordered list of operation ids. A checker process later scans these
//! logs and certifies that each operation was observed exactly once. All
//! value types here are immutable: operations return new values, equality is
//! structural, and the serde encoding is canonical (ordered keys) so that a
//! backend comparing encoded bytes agrees with `PartialEq`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of cache operations, used for statistics and the workload mix.
///
/// `GetNull` is a `Get` whose result was empty; observationally a read but
/// accounted separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Get,
    GetNull,
    Put,
    Remove,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Get,
        Operation::GetNull,
        Operation::Put,
        Operation::Remove,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Operation::Get => 0,
            Operation::GetNull => 1,
            Operation::Put => 2,
            Operation::Remove => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "GET",
            Operation::GetNull => "GET_NULL",
            Operation::Put => "PUT",
            Operation::Remove => "REMOVE",
        };
        write!(f, "{}", name)
    }
}

/// Log value owned by exactly one worker.
///
/// Holds the producing worker id and the ordered, strictly increasing list of
/// operation ids that worker has issued and the checker has not yet
/// certified. The worker id never changes over the lifetime of a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateLogValue {
    thread_id: i32,
    operation_ids: Vec<i64>,
}

impl PrivateLogValue {
    /// A fresh value holding a single operation id.
    pub fn new(thread_id: i32, operation_id: i64) -> Self {
        PrivateLogValue {
            thread_id,
            operation_ids: vec![operation_id],
        }
    }

    pub fn from_ids(thread_id: i32, operation_ids: Vec<i64>) -> Self {
        debug_assert!(!operation_ids.is_empty());
        PrivateLogValue {
            thread_id,
            operation_ids,
        }
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    pub fn size(&self) -> usize {
        self.operation_ids.len()
    }

    /// Operation id at position `index` (oldest first).
    pub fn operation_id(&self, index: usize) -> i64 {
        self.operation_ids[index]
    }

    /// New value with `operation_id` appended.
    pub fn with(&self, operation_id: i64) -> Self {
        let mut ids = Vec::with_capacity(self.operation_ids.len() + 1);
        ids.extend_from_slice(&self.operation_ids);
        ids.push(operation_id);
        PrivateLogValue {
            thread_id: self.thread_id,
            operation_ids: ids,
        }
    }

    /// New value with the first `drop_count` ids discarded and `operation_id`
    /// appended. Used once the checker has certified a prefix.
    pub fn shift(&self, drop_count: usize, operation_id: i64) -> Self {
        let mut ids = Vec::with_capacity(self.operation_ids.len() - drop_count + 1);
        ids.extend_from_slice(&self.operation_ids[drop_count..]);
        ids.push(operation_id);
        PrivateLogValue {
            thread_id: self.thread_id,
            operation_ids: ids,
        }
    }
}

impl fmt::Display for PrivateLogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[thread #{}: {:?}]", self.thread_id, self.operation_ids)
    }
}

/// Log value that any worker may write.
///
/// Logically a mapping from worker id to that worker's ordered operation-id
/// subsequence. Stored in a `BTreeMap` so the serialized form is canonical
/// regardless of insertion order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLogValue {
    ops: BTreeMap<i32, Vec<i64>>,
}

impl SharedLogValue {
    /// A fresh value holding a single operation id for one worker.
    pub fn new(thread_id: i32, operation_id: i64) -> Self {
        let mut ops = BTreeMap::new();
        ops.insert(thread_id, vec![operation_id]);
        SharedLogValue { ops }
    }

    /// Total number of operation ids across all workers.
    pub fn size(&self) -> usize {
        self.ops.values().map(Vec::len).sum()
    }

    /// The given worker's subsequence, oldest first.
    pub fn thread_ops(&self, thread_id: i32) -> &[i64] {
        self.ops.get(&thread_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Smallest operation id recorded for `thread_id`, or `i64::MAX` when the
    /// worker has no entry. Bounds checker queries from below.
    pub fn min_from(&self, thread_id: i32) -> i64 {
        self.ops
            .get(&thread_id)
            .and_then(|ids| ids.first().copied())
            .unwrap_or(i64::MAX)
    }

    /// New value with `operation_id` appended to `thread_id`'s subsequence.
    pub fn with(&self, thread_id: i32, operation_id: i64) -> Self {
        let mut ops = self.ops.clone();
        ops.entry(thread_id).or_default().push(operation_id);
        SharedLogValue { ops }
    }

    /// New value that first discards, for every worker `t`, the prefix of its
    /// subsequence with ids at or below `min_seen[t]`, then appends
    /// `operation_id` to `thread_id`'s subsequence.
    pub fn with_filtered(
        &self,
        thread_id: i32,
        operation_id: i64,
        min_seen: &BTreeMap<i32, i64>,
    ) -> Self {
        let mut ops = BTreeMap::new();
        for (&t, ids) in &self.ops {
            let floor = min_seen.get(&t).copied().unwrap_or(i64::MIN);
            let kept: Vec<i64> = ids.iter().copied().filter(|&id| id > floor).collect();
            if !kept.is_empty() {
                ops.insert(t, kept);
            }
        }
        ops.entry(thread_id).or_default().push(operation_id);
        SharedLogValue { ops }
    }

    /// Merge with another value, concatenating per-worker subsequences and
    /// deduplicating by id. Used to reconcile a key with its backup, where
    /// both copies may momentarily exist.
    pub fn join(&self, other: &SharedLogValue) -> Self {
        let mut ops = BTreeMap::new();
        let threads: std::collections::BTreeSet<i32> = self
            .ops
            .keys()
            .chain(other.ops.keys())
            .copied()
            .collect();
        for t in threads {
            let merged = merge_sorted_unique(self.thread_ops(t), other.thread_ops(t));
            if !merged.is_empty() {
                ops.insert(t, merged);
            }
        }
        SharedLogValue { ops }
    }
}

impl fmt::Display for SharedLogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (t, ids)) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "#{}: {:?}", t, ids)?;
        }
        write!(f, "}}")
    }
}

// Both inputs are individually sorted ascending; produce their sorted union.
fn merge_sorted_unique(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let next = match (a.get(i), b.get(j)) {
            (Some(&x), Some(&y)) if x < y => {
                i += 1;
                x
            }
            (Some(&x), Some(&y)) if x > y => {
                j += 1;
                y
            }
            (Some(&x), Some(_)) => {
                i += 1;
                j += 1;
                x
            }
            (Some(&x), None) => {
                i += 1;
                x
            }
            (None, Some(&y)) => {
                j += 1;
                y
            }
            (None, None) => break,
        };
        if out.last() != Some(&next) {
            out.push(next);
        }
    }
    out
}

/// Per-worker checkpoint written by the stressor and watermark written by
/// checkers. Pairs the operation id with the exact key-selector RNG state at
/// that moment so a restarted worker resumes the identical sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub operation_id: i64,
    pub rng_state: u64,
}

impl LastOperation {
    pub fn new(operation_id: i64, rng_state: u64) -> Self {
        LastOperation {
            operation_id,
            rng_state,
        }
    }
}

/// The tagged union of everything the stressor stores in the cache.
///
/// A value of an unexpected variant at a log key is a consistency violation,
/// never silently coerced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Opaque payload written by the load phase and the legacy logic.
    Bytes(Vec<u8>),
    Private(PrivateLogValue),
    Shared(SharedLogValue),
    /// Stressor checkpoint or checker watermark.
    LastOp(LastOperation),
    /// Bare operation id, used for ignored-checker floors.
    OpId(i64),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Bytes(_) => "bytes",
            StoredValue::Private(_) => "private log value",
            StoredValue::Shared(_) => "shared log value",
            StoredValue::LastOp(_) => "last operation",
            StoredValue::OpId(_) => "operation id",
        }
    }
}

impl From<PrivateLogValue> for StoredValue {
    fn from(v: PrivateLogValue) -> Self {
        StoredValue::Private(v)
    }
}

impl From<SharedLogValue> for StoredValue {
    fn from(v: SharedLogValue) -> Self {
        StoredValue::Shared(v)
    }
}

impl From<LastOperation> for StoredValue {
    fn from(v: LastOperation) -> Self {
        StoredValue::LastOp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_with_appends() {
        let v = PrivateLogValue::from_ids(3, vec![10, 11, 12]);
        let next = v.with(13);
        assert_eq!(next.size(), v.size() + 1);
        assert_eq!(next.operation_id(next.size() - 1), 13);
        assert_eq!(next.thread_id(), 3);
        // original untouched
        assert_eq!(v.size(), 3);
    }

    #[test]
    fn test_private_shift_drops_prefix_and_appends() {
        let v = PrivateLogValue::from_ids(0, vec![5, 6, 7, 8]);
        for k in 1..=v.size() {
            let shifted = v.shift(k, 99);
            assert_eq!(shifted.size(), v.size() - k + 1);
            let mut expected: Vec<i64> = (5..9).skip(k).collect();
            expected.push(99);
            let actual: Vec<i64> = (0..shifted.size()).map(|i| shifted.operation_id(i)).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_private_structural_equality() {
        let a = PrivateLogValue::from_ids(1, vec![1, 2]);
        let b = PrivateLogValue::new(1, 1).with(2);
        assert_eq!(a, b);
        assert_ne!(a, PrivateLogValue::from_ids(2, vec![1, 2]));
    }

    #[test]
    fn test_shared_with_appends_to_own_thread() {
        let v = SharedLogValue::new(0, 1).with(1, 5).with(0, 2);
        assert_eq!(v.thread_ops(0), &[1, 2]);
        assert_eq!(v.thread_ops(1), &[5]);
        assert_eq!(v.size(), 3);
    }

    #[test]
    fn test_shared_join_commutative_and_idempotent() {
        let a = SharedLogValue::new(0, 1).with(0, 2).with(1, 7);
        let b = SharedLogValue::new(0, 2).with(0, 3).with(2, 4);

        let ab = a.join(&b);
        let ba = b.join(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.thread_ops(0), &[1, 2, 3]);
        assert_eq!(ab.thread_ops(1), &[7]);
        assert_eq!(ab.thread_ops(2), &[4]);

        assert_eq!(a.join(&a), a);
    }

    #[test]
    fn test_shared_with_filtered_drops_certified_prefixes() {
        let v = SharedLogValue::new(0, 1)
            .with(0, 2)
            .with(0, 3)
            .with(1, 10)
            .with(1, 11);
        let mut mins = BTreeMap::new();
        mins.insert(0, 2i64);
        mins.insert(1, 11i64);

        let filtered = v.with_filtered(0, 4, &mins);
        assert_eq!(filtered.thread_ops(0), &[3, 4]);
        assert!(filtered.thread_ops(1).is_empty());
        for (&t, &floor) in &mins {
            assert!(filtered.thread_ops(t).iter().all(|&id| id > floor));
        }
    }

    #[test]
    fn test_shared_with_filtered_missing_thread_keeps_all() {
        let v = SharedLogValue::new(5, 100).with(5, 101);
        let mins = BTreeMap::new();
        let filtered = v.with_filtered(5, 102, &mins);
        assert_eq!(filtered.thread_ops(5), &[100, 101, 102]);
    }

    #[test]
    fn test_shared_min_from() {
        let v = SharedLogValue::new(0, 42).with(0, 43);
        assert_eq!(v.min_from(0), 42);
        assert_eq!(v.min_from(9), i64::MAX);
    }

    #[test]
    fn test_canonical_encoding_is_stable() {
        // Same logical value built in different insertion orders must encode
        // to identical bytes, otherwise compare-and-swap against the backend
        // would disagree with structural equality.
        let a = SharedLogValue::new(2, 20).with(1, 10).with(0, 5);
        let b = SharedLogValue::new(0, 5).with(2, 20).with(1, 10);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_stored_value_round_trip() {
        let values = vec![
            StoredValue::Bytes(vec![1, 2, 3]),
            StoredValue::Private(PrivateLogValue::from_ids(1, vec![4, 5])),
            StoredValue::Shared(SharedLogValue::new(0, 9)),
            StoredValue::LastOp(LastOperation::new(17, 0xDEAD)),
            StoredValue::OpId(23),
        ];
        for v in values {
            let encoded = serde_json::to_string(&v).unwrap();
            let decoded: StoredValue = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, v);
        }
    }
}
