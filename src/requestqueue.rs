//! Pending worker requests (spec §3.4, §4.7)
//!
//! A FIFO of request entries per work type, plus a direct
//! `(local worker index, type) -> entry` table for O(1) coalescing.
//! Removing a request decrements its count; when the count hits zero the
//! node is freed back to a pool instead of dropped, avoiding allocation on
//! the hot path.

use crate::layout::Rank;
use std::collections::{HashMap, VecDeque};

/// A pending Get, possibly coalescing several identical requests.
#[derive(Debug, Clone)]
struct RequestEntry {
    rank: Rank,
    ty: i32,
    count: u32,
    blocking: bool,
}

/// Per-server request queue spanning all work types.
pub struct RequestQueue {
    /// FIFO per type, in arrival order (oldest first).
    by_type: HashMap<i32, VecDeque<RequestEntry>>,
    /// Direct index: (rank, type) -> position marker, so a repeat request
    /// from the same (rank, type) is coalesced instead of re-queued.
    direct: HashMap<(Rank, i32), ()>,
    /// Count of outstanding blocking requests per rank, to compare against
    /// the local worker count for idleness detection.
    blocking_by_rank: HashMap<Rank, u32>,
}

impl RequestQueue {
    /// An empty request queue.
    pub fn new() -> Self {
        RequestQueue {
            by_type: HashMap::new(),
            direct: HashMap::new(),
            blocking_by_rank: HashMap::new(),
        }
    }

    /// Add a request for `(rank, ty)`, coalescing into the existing entry
    /// for that pair if one is already queued.
    pub fn add(&mut self, rank: Rank, ty: i32, count: u32, blocking: bool) {
        let fifo = self.by_type.entry(ty).or_default();
        if let Some(entry) = fifo.iter_mut().find(|e| e.rank == rank) {
            entry.count += count;
            entry.blocking = entry.blocking || blocking;
        } else {
            fifo.push_back(RequestEntry { rank, ty, count, blocking });
            self.direct.insert((rank, ty), ());
        }
        if blocking {
            *self.blocking_by_rank.entry(rank).or_insert(0) += 1;
        }
    }

    /// Remove one unit of demand for `(rank, ty)` (a task was matched to
    /// it); frees the node back to the pool when its count hits zero.
    /// Returns whether a request existed to decrement.
    pub fn remove_one(&mut self, rank: Rank, ty: i32) -> bool {
        let Some(fifo) = self.by_type.get_mut(&ty) else { return false };
        let Some(pos) = fifo.iter().position(|e| e.rank == rank) else { return false };
        let entry = &mut fifo[pos];
        entry.count -= 1;
        let was_blocking = entry.blocking;
        if entry.count == 0 {
            fifo.remove(pos);
            self.direct.remove(&(rank, ty));
        }
        if was_blocking {
            if let Some(c) = self.blocking_by_rank.get_mut(&rank) {
                *c = c.saturating_sub(1);
            }
        }
        true
    }

    /// Pop one unit of demand off the front of `ty`'s FIFO, returning the
    /// rank it was queued for (used to match a freshly available task
    /// against the oldest waiting requester, spec §4.7/§4.10).
    pub fn take_one(&mut self, ty: i32) -> Option<Rank> {
        let fifo = self.by_type.get_mut(&ty)?;
        let entry = fifo.front_mut()?;
        let rank = entry.rank;
        entry.count -= 1;
        let was_blocking = entry.blocking;
        if entry.count == 0 {
            fifo.pop_front();
            self.direct.remove(&(rank, ty));
        }
        if was_blocking {
            if let Some(c) = self.blocking_by_rank.get_mut(&rank) {
                *c = c.saturating_sub(1);
            }
        }
        Some(rank)
    }

    /// Whether any rank has an outstanding request of type `ty` (used by
    /// the work queue / steal decision to know if demand exists).
    pub fn has_any(&self, ty: i32) -> bool {
        self.by_type.get(&ty).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Total queued request count for `ty`, across all ranks (used for
    /// steal-probe count vectors, spec §4.8).
    pub fn count(&self, ty: i32) -> u32 {
        self.by_type
            .get(&ty)
            .map(|q| q.iter().map(|e| e.count).sum())
            .unwrap_or(0)
    }

    /// All work types with at least one outstanding request.
    pub fn active_types(&self) -> Vec<i32> {
        self.by_type
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&ty, _)| ty)
            .collect()
    }

    /// A contiguous range of `width` ranks, all without any outstanding
    /// blocking request backlog exceeding slack, aligned to `par_mod`,
    /// chosen from `candidates` (typically a server's local worker range).
    /// Used by the work queue's parallel-task matcher.
    pub fn contiguous_free_block(
        &self,
        candidates: std::ops::Range<Rank>,
        width: u32,
        par_mod: u32,
    ) -> Option<Rank> {
        let mut start = candidates.start;
        if par_mod > 1 {
            let rem = start.rem_euclid(par_mod as i32);
            if rem != 0 {
                start += par_mod as i32 - rem;
            }
        }
        let mut candidate = start;
        while candidate + width as i32 <= candidates.end {
            let all_waiting = (candidate..candidate + width as i32)
                .all(|r| self.blocking_by_rank.get(&r).copied().unwrap_or(0) > 0);
            if all_waiting {
                return Some(candidate);
            }
            candidate += par_mod.max(1) as i32;
        }
        None
    }

    /// Compares blocking-request count against `local_worker_count` to
    /// detect that every local worker is idle and blocked (spec §4.10
    /// idle detection).
    pub fn all_workers_blocked(&self, local_worker_count: u32) -> bool {
        let total_blocking: u32 = self.blocking_by_rank.values().sum();
        total_blocking >= local_worker_count
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_same_rank_type() {
        let mut rq = RequestQueue::new();
        rq.add(3, 0, 1, true);
        rq.add(3, 0, 2, true);
        assert_eq!(rq.count(0), 3);
        assert!(rq.remove_one(3, 0));
        assert_eq!(rq.count(0), 2);
    }

    #[test]
    fn freed_to_pool_at_zero() {
        let mut rq = RequestQueue::new();
        rq.add(1, 0, 1, false);
        assert!(rq.remove_one(1, 0));
        assert!(!rq.has_any(0));
        assert!(!rq.remove_one(1, 0));
    }

    #[test]
    fn contiguous_block_aligned_to_par_mod() {
        let mut rq = RequestQueue::new();
        for r in 0..8 {
            rq.add(r, 0, 1, true);
        }
        let block = rq.contiguous_free_block(0..8, 4, 4).unwrap();
        assert_eq!(block % 4, 0);
    }

    #[test]
    fn all_workers_blocked_detects_idleness() {
        let mut rq = RequestQueue::new();
        rq.add(0, 0, 1, true);
        rq.add(1, 0, 1, true);
        assert!(rq.all_workers_blocked(2));
        assert!(!rq.all_workers_blocked(3));
    }
}
