//! Bounded top-k accumulation
//!
//! Keeps the `k` entries with the largest value. Among equal values the
//! earlier arrival wins, so results follow term iteration order on ties.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug)]
struct Entry<T> {
    value: f64,
    seq: u64,
    item: T,
}

fn rank(value: f64) -> f64 {
    if value.is_nan() {
        f64::NEG_INFINITY
    } else {
        value
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// The heap top is the weakest entry: lowest value, latest arrival.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        rank(other.value)
            .total_cmp(&rank(self.value))
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
pub struct TopK<T> {
    limit: usize,
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
}

impl<T> TopK<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            heap: BinaryHeap::with_capacity(limit.min(1024) + 1),
            seq: 0,
        }
    }

    pub fn offer(&mut self, value: f64, item: T) {
        let seq = self.seq;
        self.seq += 1;
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(Entry { value, seq, item });
            return;
        }
        let beats_weakest = self
            .heap
            .peek()
            .map_or(false, |weakest| rank(value) > rank(weakest.value));
        if beats_weakest {
            self.heap.pop();
            self.heap.push(Entry { value, seq, item });
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries by value descending, ties by arrival
    pub fn into_sorted(self) -> Vec<(f64, T)> {
        let mut entries = self.heap.into_vec();
        entries.sort_by(|a, b| a.cmp(b));
        entries.into_iter().map(|e| (e.value, e.item)).collect()
    }
}
