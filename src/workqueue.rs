//! Per-server, per-work-type priority queues (spec §3.3, §4.6)
//!
//! Four indices share one backing arena: an untargeted max-heap, a
//! rank-targeted max-heap per local worker, a host-targeted max-heap per
//! local host, and a parallel-task list. Heap entries carry a generation
//! counter alongside the arena index so a popped-and-reused slot is
//! recognized as stale instead of silently returning the wrong task
//! (Design Notes §9: arena + stable index in place of raw pointers).

use crate::layout::{HostId, Layout, Rank};
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reduces a soft-targeted task's priority in the untargeted heap so it is
/// matched preferentially to its target but still reachable by anyone.
pub const SOFT_TARGET_PENALTY: i64 = 1_000_000_000;

/// Target strictness (spec §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strictness {
    /// Must run on the target; never placed in the untargeted heap.
    Hard,
    /// Prefer the target; also reachable via the untargeted heap at
    /// reduced priority.
    Soft,
}

/// Target accuracy (spec §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    /// Exact rank.
    Rank,
    /// Any worker sharing a host with the nominal target.
    Node,
}

/// Where a task is targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Any worker may run it.
    Any,
    /// A specific rank (with strictness/accuracy qualifiers).
    Rank(Rank, Strictness, Accuracy),
}

/// A task (work unit), spec §3.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Work type tag.
    pub ty: i32,
    /// Scheduling priority (higher = preferred).
    pub priority: i64,
    /// Number of workers this task must run on simultaneously.
    pub parallelism: u32,
    /// Target rank, if any.
    pub target: Target,
    /// Rank to deliver the result to.
    pub answer_rank: Rank,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

struct ArenaSlot {
    generation: u32,
    task: Option<Task>,
}

/// A validated reference into the arena: an index plus the generation it
/// was inserted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HeapKey {
    idx: u32,
    generation: u32,
}

#[derive(Default)]
struct PerType {
    untargeted: PriorityQueue<HeapKey, i64>,
    rank_targeted: HashMap<Rank, PriorityQueue<HeapKey, i64>>,
    host_targeted: HashMap<HostId, PriorityQueue<HeapKey, i64>>,
    /// Parallel tasks: (HeapKey, parallelism, priority). Walked
    /// smallest-parallelism-first by `pop_parallel`.
    parallel: Vec<(HeapKey, u32, i64)>,
}

/// Per-server work queue spanning all work types.
pub struct WorkQueue {
    arena: Vec<ArenaSlot>,
    free: Vec<u32>,
    by_type: HashMap<i32, PerType>,
}

impl WorkQueue {
    /// An empty work queue.
    pub fn new() -> Self {
        WorkQueue {
            arena: Vec::new(),
            free: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    fn alloc(&mut self, task: Task) -> HeapKey {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.arena[idx as usize];
            slot.generation += 1;
            slot.task = Some(task);
            HeapKey { idx, generation: slot.generation }
        } else {
            let idx = self.arena.len() as u32;
            self.arena.push(ArenaSlot { generation: 0, task: Some(task) });
            HeapKey { idx, generation: 0 }
        }
    }

    fn valid(&self, key: HeapKey) -> bool {
        self.arena
            .get(key.idx as usize)
            .map(|s| s.generation == key.generation && s.task.is_some())
            .unwrap_or(false)
    }

    fn take(&mut self, key: HeapKey) -> Option<Task> {
        let slot = self.arena.get_mut(key.idx as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let task = slot.task.take();
        if task.is_some() {
            self.free.push(key.idx);
        }
        task
    }

    /// Insert a task, indexing it per spec §4.6's targeting rule.
    pub fn put(&mut self, layout: &Layout, task: Task) {
        let ty = task.ty;
        let priority = task.priority;
        let parallelism = task.parallelism;
        let target = task.target;

        if parallelism > 1 {
            let key = self.alloc(task);
            let per_type = self.by_type.entry(ty).or_default();
            per_type.parallel.push((key, parallelism, priority));
            return;
        }

        match target {
            Target::Any => {
                let key = self.alloc(task);
                self.by_type.entry(ty).or_default().untargeted.push(key, priority);
            }
            Target::Rank(rank, strictness, accuracy) => {
                let key = self.alloc(task);
                let per_type = self.by_type.entry(ty).or_default();
                match accuracy {
                    Accuracy::Rank => {
                        per_type.rank_targeted.entry(rank).or_default().push(key, priority);
                    }
                    Accuracy::Node => {
                        if layout.host_peers(rank).is_empty() {
                            // Hostmap disabled: NODE targeting degrades to RANK.
                            per_type.rank_targeted.entry(rank).or_default().push(key, priority);
                        } else {
                            per_type.host_targeted.entry(host_of(layout, rank)).or_default().push(key, priority);
                        }
                    }
                }
                if strictness == Strictness::Soft {
                    // Re-insert the same arena key into the untargeted heap
                    // at reduced priority; whichever heap is popped first
                    // wins and the other's entry becomes stale on the next
                    // pop, since both point at the one shared slot.
                    self.by_type
                        .entry(ty)
                        .or_default()
                        .untargeted
                        .push(key, priority - SOFT_TARGET_PENALTY);
                }
            }
        }
    }

    /// Pop the best-matching task for a Get(type) from `rank` (spec §4.6
    /// matching order: rank-targeted -> host-targeted -> untargeted).
    pub fn pop_for(&mut self, layout: &Layout, rank: Rank, ty: i32) -> Option<Task> {
        let host = host_of(layout, rank);
        let per_type = self.by_type.get_mut(&ty)?;

        if let Some(task) = pop_valid(&mut per_type.rank_targeted, &rank, &self.arena) {
            return self.finish_pop(task);
        }
        if let Some(task) = pop_valid(&mut per_type.host_targeted, &host, &self.arena) {
            return self.finish_pop(task);
        }
        loop {
            let key = per_type.untargeted.pop().map(|(k, _)| k)?;
            if self.valid(key) {
                return self.take(key);
            }
        }
    }

    fn finish_pop(&mut self, key: HeapKey) -> Option<Task> {
        self.take(key)
    }

    /// Walk the parallel-task list smallest-parallelism-first; `try_place`
    /// is asked, for each candidate, whether a contiguous worker block of
    /// that size is currently available (typically backed by the request
    /// queue). Returns the first task `try_place` accepts.
    pub fn pop_parallel(&mut self, ty: i32, mut try_place: impl FnMut(u32) -> bool) -> Option<Task> {
        let per_type = self.by_type.get_mut(&ty)?;
        per_type.parallel.sort_by_key(|(_, parallelism, _)| *parallelism);
        let pos = per_type
            .parallel
            .iter()
            .position(|(key, parallelism, _)| self.valid(*key) && try_place(*parallelism))?;
        let (key, _, _) = per_type.parallel.remove(pos);
        self.take(key)
    }

    /// Number of live (non-stale) tasks queued for `ty`, for steal-probe
    /// counts (spec §4.8).
    pub fn count(&self, ty: i32) -> usize {
        let per_type = match self.by_type.get(&ty) {
            Some(p) => p,
            None => return 0,
        };
        let untargeted = per_type.untargeted.iter().filter(|(k, _)| self.valid(**k)).count();
        let rank = per_type
            .rank_targeted
            .values()
            .flat_map(|h| h.iter())
            .filter(|(k, _)| self.valid(**k))
            .count();
        let host = per_type
            .host_targeted
            .values()
            .flat_map(|h| h.iter())
            .filter(|(k, _)| self.valid(**k))
            .count();
        let parallel = per_type.parallel.iter().filter(|(k, _, _)| self.valid(*k)).count();
        untargeted + rank + host + parallel
    }

    /// All work types with at least one live task.
    pub fn active_types(&self) -> Vec<i32> {
        self.by_type.keys().copied().collect()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn host_of(layout: &Layout, rank: Rank) -> HostId {
    // `Layout` keys its table by HostId but only exposes peer lists; a
    // rank's host is recovered as the smallest peer's position bucket.
    // Since `Layout` doesn't expose a direct rank->host accessor beyond
    // `host_peers`, and all peers (including `rank`) share one id, we use
    // the peer list itself as the grouping key via its first element.
    layout.host_peers(rank).first().copied().unwrap_or(rank) as HostId
}

fn pop_valid<K: std::hash::Hash + Eq + Clone>(
    map: &mut HashMap<K, PriorityQueue<HeapKey, i64>>,
    key: &K,
    arena: &[ArenaSlot],
) -> Option<HeapKey> {
    let heap = map.get_mut(key)?;
    loop {
        let (k, _) = heap.pop()?;
        if arena
            .get(k.idx as usize)
            .map(|s| s.generation == k.generation && s.task.is_some())
            .unwrap_or(false)
        {
            return Some(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(8, 2, |w| (w / 4) as HostId)
    }

    fn task(ty: i32, priority: i64, target: Target) -> Task {
        Task { ty, priority, parallelism: 1, target, answer_rank: 0, payload: vec![] }
    }

    #[test]
    fn matching_order_rank_then_host_then_untargeted() {
        let layout = layout();
        let mut wq = WorkQueue::new();
        wq.put(&layout, task(0, 1, Target::Any));
        wq.put(&layout, task(0, 1, Target::Rank(0, Strictness::Hard, Accuracy::Rank)));

        let popped = wq.pop_for(&layout, 0, 0).unwrap();
        assert!(matches!(popped.target, Target::Rank(0, Strictness::Hard, Accuracy::Rank)));
        let popped2 = wq.pop_for(&layout, 0, 0).unwrap();
        assert!(matches!(popped2.target, Target::Any));
        assert!(wq.pop_for(&layout, 0, 0).is_none());
    }

    #[test]
    fn soft_target_reachable_both_ways() {
        let layout = layout();
        let mut wq = WorkQueue::new();
        wq.put(&layout, task(0, 5, Target::Rank(1, Strictness::Soft, Accuracy::Rank)));
        // Another rank can still steal it via the untargeted heap.
        let popped = wq.pop_for(&layout, 5, 0).unwrap();
        assert!(matches!(popped.target, Target::Rank(1, Strictness::Soft, Accuracy::Rank)));
        assert!(wq.pop_for(&layout, 1, 0).is_none());
    }

    #[test]
    fn stale_entries_are_skipped() {
        let layout = layout();
        let mut wq = WorkQueue::new();
        wq.put(&layout, task(0, 1, Target::Rank(0, Strictness::Soft, Accuracy::Rank)));
        // Pop via rank-targeted heap first; the untargeted duplicate key
        // should then be recognized as stale.
        let t1 = wq.pop_for(&layout, 0, 0);
        assert!(t1.is_some());
        let t2 = wq.pop_for(&layout, 2, 0);
        assert!(t2.is_none());
    }
}
