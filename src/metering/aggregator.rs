//! Write-coalescing accumulator for per-token usage deltas.
//!
//! Each token gets one `AtomicI64` cell. Creating a cell takes the DashMap
//! shard's write lock; once the cell exists, producers only hold the shard's
//! shared lock while doing a lock-free compare-and-swap, so concurrent
//! increments to existing cells never serialize on each other.
//!
//! `drain` removes cells one at a time under the shard write lock. A remove
//! cannot overlap an in-flight update on the same cell, so every delta lands
//! either in the drained value or in a fresh cell created afterwards.
//!
//! A cell never wraps and never holds `i64::MIN`. An add that would push it
//! out of range is kept aside as its own entry and drained alongside.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::models::delta::PendingDelta;

#[derive(Default)]
pub struct DeltaAggregator {
    cells: DashMap<i64, AtomicI64>,
    /// Adds that did not fit in their token's cell.
    overflow: Mutex<Vec<PendingDelta>>,
}

/// Add `delta` to `cell` unless the sum leaves `(i64::MIN, i64::MAX]`.
fn accumulate(cell: &AtomicI64, delta: i64) -> bool {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        current.checked_add(delta).filter(|sum| *sum != i64::MIN)
    })
    .is_ok()
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token_id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        if delta == i64::MIN {
            // no single credit can express it
            self.add(token_id, i64::MIN + 1);
            self.add(token_id, -1);
            return;
        }

        let fitted = match self.cells.get(&token_id) {
            Some(cell) => accumulate(&cell, delta),
            // first touch: entry() re-checks under the shard write lock
            None => accumulate(
                &self.cells.entry(token_id).or_insert_with(|| AtomicI64::new(0)),
                delta,
            ),
        };
        if !fitted {
            tracing::warn!(token_id, delta, "usage delta exceeds cell range, keeping it separate");
            self.overflow_entries().push(PendingDelta { token_id, delta });
        }
    }

    /// Fold entries back in, e.g. deltas that failed to persist.
    pub fn merge(&self, entries: &[PendingDelta]) {
        for entry in entries {
            self.add(entry.token_id, entry.delta);
        }
    }

    /// Remove and return every non-zero accumulated delta. A token appears
    /// more than once only when its usage did not fit in a single i64.
    pub fn drain(&self) -> Vec<PendingDelta> {
        let ids: Vec<i64> = self.cells.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((token_id, cell)) = self.cells.remove(&id) {
                let delta = cell.into_inner();
                if delta != 0 {
                    drained.push(PendingDelta { token_id, delta });
                }
            }
        }
        drained.append(&mut self.overflow_entries());
        drained
    }

    /// Accumulated, unflushed delta for one token, saturating at the i64 range.
    pub fn pending(&self, token_id: i64) -> i64 {
        let cell = self
            .cells
            .get(&token_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0);
        self.overflow_entries()
            .iter()
            .filter(|e| e.token_id == token_id)
            .fold(cell, |acc, e| acc.saturating_add(e.delta))
    }

    /// Tokens with an accumulated delta.
    pub fn pending_ids(&self) -> HashSet<i64> {
        let mut ids: HashSet<i64> = self.cells.iter().map(|e| *e.key()).collect();
        ids.extend(self.overflow_entries().iter().map(|e| e.token_id));
        ids
    }

    pub fn pending_len(&self) -> usize {
        self.pending_ids().len()
    }

    fn overflow_entries(&self) -> std::sync::MutexGuard<'_, Vec<PendingDelta>> {
        // the guarded Vec stays consistent even if a holder panicked
        self.overflow.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deltas_coalesce_per_token() {
        let agg = DeltaAggregator::new();
        agg.add(1, 10);
        agg.add(1, 5);
        agg.add(1, -3);
        agg.add(2, 7);
        let mut drained = agg.drain();
        drained.sort_by_key(|d| d.token_id);
        assert_eq!(
            drained,
            vec![
                PendingDelta { token_id: 1, delta: 12 },
                PendingDelta { token_id: 2, delta: 7 },
            ]
        );
        assert_eq!(agg.pending_len(), 0);
    }

    #[test]
    fn test_drain_skips_cancelled_out_tokens() {
        let agg = DeltaAggregator::new();
        agg.add(1, 10);
        agg.add(1, -10);
        assert!(agg.drain().is_empty());
        // and the empty cell was removed, not left behind
        assert_eq!(agg.pending_len(), 0);
    }

    #[test]
    fn test_zero_delta_creates_no_cell() {
        let agg = DeltaAggregator::new();
        agg.add(1, 0);
        assert_eq!(agg.pending_len(), 0);
    }

    #[test]
    fn test_merge_adds_to_existing_cell() {
        let agg = DeltaAggregator::new();
        agg.add(1, 4);
        agg.merge(&[PendingDelta { token_id: 1, delta: 6 }]);
        assert_eq!(agg.pending(1), 10);
    }

    #[test]
    fn test_concurrent_adds_with_drains_conserve_total() {
        let agg = Arc::new(DeltaAggregator::new());
        let threads = 8;
        let per_thread = 10_000i64;

        let producers: Vec<_> = (0..threads)
            .map(|t| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        agg.add(i % 4, if (i + t) % 5 == 0 { -1 } else { 2 });
                    }
                })
            })
            .collect();

        let mut drained_total = 0i64;
        while producers.iter().any(|p| !p.is_finished()) {
            drained_total += agg.drain().iter().map(|d| d.delta).sum::<i64>();
        }
        for p in producers {
            p.join().unwrap();
        }
        drained_total += agg.drain().iter().map(|d| d.delta).sum::<i64>();

        let expected: i64 = (0..threads)
            .map(|t| {
                (0..per_thread)
                    .map(|i| if (i + t) % 5 == 0 { -1 } else { 2 })
                    .sum::<i64>()
            })
            .sum();
        assert_eq!(drained_total, expected);
    }

    #[test]
    fn test_sum_past_i64_max_is_kept_separate() {
        let agg = DeltaAggregator::new();
        agg.add(1, i64::MAX);
        agg.add(1, 1);
        let mut drained = agg.drain();
        drained.sort_by_key(|d| d.delta);
        assert_eq!(
            drained,
            vec![
                PendingDelta { token_id: 1, delta: 1 },
                PendingDelta { token_id: 1, delta: i64::MAX },
            ]
        );
        assert!(drained.iter().all(|d| d.delta > 0));
        assert_eq!(agg.pending_len(), 0);
    }

    #[test]
    fn test_i64_min_is_split_into_creditable_parts() {
        let agg = DeltaAggregator::new();
        agg.add(1, i64::MIN);
        let drained = agg.drain();
        assert!(drained.iter().all(|d| d.delta != i64::MIN));
        let total: i128 = drained.iter().map(|d| d.delta as i128).sum();
        assert_eq!(total, i64::MIN as i128);
    }

    #[test]
    fn test_pending_saturates_with_overflow_entries() {
        let agg = DeltaAggregator::new();
        agg.add(3, i64::MAX);
        agg.add(3, 10);
        assert_eq!(agg.pending(3), i64::MAX);
        assert_eq!(agg.pending_len(), 1);
    }
}
