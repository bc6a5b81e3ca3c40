//! Bounded best-results store: keeps the top N scored combinations and
//! nothing else, so memory stays O(N) no matter how large the sweep is.
//!
//! Backed by a min-heap keyed on score, so the worst kept entry is always at
//! the root: an incoming result either beats it (evict and insert, O(log N))
//! or is dropped in O(1). Ties favor the incumbent.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::result::CombinationResult;

#[derive(Debug, Clone)]
struct Ranked {
    score: f64,
    seq: u64,
    result: CombinationResult,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    // Primary: score. Equal scores order the later arrival first for
    // eviction, so earlier results win ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded store of the N best combination results seen so far.
#[derive(Debug)]
pub struct TopNResultStore {
    capacity: usize,
    seq: u64,
    rejected_non_finite: u64,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl TopNResultStore {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seq: 0,
            rejected_non_finite: 0,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    /// Offer a result. Returns true if it was kept.
    ///
    /// Non-finite scores are rejected outright. A result that only ties the
    /// current worst is dropped; the incumbent stays.
    pub fn offer(&mut self, result: CombinationResult) -> bool {
        if !result.score.is_finite() {
            self.rejected_non_finite += 1;
            tracing::warn!(
                index = result.index,
                score = result.score,
                params = %result.params,
                "discarding result with non-finite score"
            );
            return false;
        }
        let entry = Ranked {
            score: result.score,
            seq: self.seq,
            result,
        };
        self.seq += 1;

        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
            return true;
        }
        match self.heap.peek() {
            Some(Reverse(worst)) if entry.score > worst.score => {
                self.heap.pop();
                self.heap.push(Reverse(entry));
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Score of the worst kept entry, the bar an incoming result must clear
    /// once the store is full.
    pub fn worst_score(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(r)| r.score)
    }

    /// How many offers were refused for a NaN or infinite score.
    pub fn rejected_non_finite(&self) -> u64 {
        self.rejected_non_finite
    }

    /// Current contents, best first. Clones; meant for progress snapshots.
    pub fn sorted(&self) -> Vec<CombinationResult> {
        let mut entries: Vec<&Ranked> = self.heap.iter().map(|Reverse(r)| r).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|r| r.result.clone()).collect()
    }

    /// Consume the store, best first.
    pub fn into_sorted(self) -> Vec<CombinationResult> {
        let mut entries: Vec<Ranked> = self.heap.into_iter().map(|Reverse(r)| r).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|r| r.result).collect()
    }
}
