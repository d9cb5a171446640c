//! Key Sharding Tables
//!
//! In sharded mode a multi-key `get` is split across all backends: the key
//! list is cut into contiguous runs, one run per backend, assigned in
//! dispatch order. Runs differ in length by at most one, with the extra
//! keys going to the backends contacted first.
//!
//! The split depends only on the number of keys and the number of backends,
//! so every possible partition is computed once at startup and shared
//! immutably (behind an `Arc`) by all workers. Looking up the plan for a
//! request is then a single index into the table.

use std::sync::Arc;

/// Half-open range `[begin, end)` of key indexes routed to one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: usize,
    pub end: usize,
}

impl KeyRange {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Precomputed sharding plans for every key count up to the configured
/// maximum.
#[derive(Debug)]
pub struct ShardTable {
    /// `plans[k - 1]` holds the ranges for a request with `k` keys, one
    /// range per contacted backend.
    plans: Vec<Vec<KeyRange>>,
    backends: usize,
    max_keys: usize,
}

impl ShardTable {
    /// Builds the table for `max_keys` keys over `backends` backends.
    pub fn new(max_keys: usize, backends: usize) -> Arc<Self> {
        let mut plans = Vec::with_capacity(max_keys);
        for keys in 1..=max_keys {
            let used = backends.min(keys);
            let base = keys / backends;
            let extra = keys % backends;

            let mut ranges = Vec::with_capacity(used);
            let mut begin = 0;
            for backend in 0..used {
                let len = base + usize::from(backend < extra);
                ranges.push(KeyRange {
                    begin,
                    end: begin + len,
                });
                begin += len;
            }
            plans.push(ranges);
        }
        Arc::new(Self {
            plans,
            backends,
            max_keys,
        })
    }

    /// The ranges for a request with `keys` keys, in dispatch order. At
    /// most one range per backend; requests with fewer keys than backends
    /// contact only the first `keys` backends of the rotation.
    pub fn slices(&self, keys: usize) -> &[KeyRange] {
        debug_assert!(keys >= 1 && keys <= self.max_keys);
        &self.plans[keys.clamp(1, self.max_keys) - 1]
    }

    pub fn backends(&self) -> usize {
        self.backends
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }
}
