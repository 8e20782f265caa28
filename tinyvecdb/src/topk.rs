//! Bounded top-k selection
//!
//! A min-heap of capacity `k` keeps the best similarities seen during a
//! scan. O(N log k) overall; draining yields descending similarity with
//! ascending id on ties.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// One surviving candidate: its score plus the byte range of its metadata
/// within the scanned file image, decoded only after the scan.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub similarity: f32,
    pub id: u32,
    pub metadata_span: (usize, usize),
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hit {}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower similarity ranks lower; on equal similarity the larger id
        // ranks lower so it is evicted first and survivors drain in
        // ascending id order. total_cmp keeps the ordering deterministic.
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct TopK {
    heap: BinaryHeap<Reverse<Hit>>,
    capacity: usize,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    /// Offer a candidate, displacing the current minimum when full.
    pub fn offer(&mut self, hit: Hit) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(hit));
            return;
        }
        if let Some(min) = self.heap.peek() {
            if hit > min.0 {
                self.heap.pop();
                self.heap.push(Reverse(hit));
            }
        }
    }

    /// Drain into a vector sorted by descending similarity, ascending id.
    pub fn into_descending(self) -> Vec<Hit> {
        let mut hits: Vec<Hit> = self.heap.into_iter().map(|r| r.0).collect();
        hits.sort_unstable_by(|a, b| b.cmp(a));
        hits
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(similarity: f32, id: u32) -> Hit {
        Hit {
            similarity,
            id,
            metadata_span: (0, 0),
        }
    }

    #[test]
    fn keeps_best_k() {
        let mut topk = TopK::new(3);
        for (i, s) in [0.1, 0.9, 0.3, 0.7, 0.5].iter().enumerate() {
            topk.offer(hit(*s, i as u32));
        }
        assert_eq!(topk.len(), 3);
        let out = topk.into_descending();
        let sims: Vec<f32> = out.iter().map(|h| h.similarity).collect();
        assert_eq!(sims, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn under_capacity_returns_everything() {
        let mut topk = TopK::new(10);
        topk.offer(hit(0.2, 0));
        topk.offer(hit(0.8, 1));
        let out = topk.into_descending();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 1);
    }

    #[test]
    fn ties_drain_in_ascending_id_order() {
        let mut topk = TopK::new(4);
        for id in [7u32, 2, 9, 4] {
            topk.offer(hit(0.5, id));
        }
        let ids: Vec<u32> = topk.into_descending().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 4, 7, 9]);
    }

    #[test]
    fn tie_eviction_prefers_smaller_id() {
        let mut topk = TopK::new(2);
        topk.offer(hit(0.5, 8));
        topk.offer(hit(0.5, 3));
        // Full; an equal-similarity candidate with a smaller id displaces
        // the largest-id entry.
        topk.offer(hit(0.5, 1));
        let ids: Vec<u32> = topk.into_descending().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn zero_capacity_accepts_nothing() {
        let mut topk = TopK::new(0);
        topk.offer(hit(1.0, 0));
        assert!(topk.is_empty());
        assert!(topk.into_descending().is_empty());
    }
}
