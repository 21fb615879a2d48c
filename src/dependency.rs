//! Data-dependent task registration (spec §4.9)
//!
//! A `dput` names a task plus a wait-set of datum ids and (id, subscript)
//! pairs. The engine on the home server keeps one transition record per
//! wait-set, subscribes to each precondition via C4's listener tree
//! (forwarding via `SyncMode::Subscribe` when the datum is homed
//! elsewhere), and releases the task onto a ready-work array once every
//! precondition has fired. The server loop drains that array in one
//! batch per iteration so a notification firing deep inside store
//! processing never re-enters the work queue directly.

use crate::data::{DataStore, Subscript};
use crate::error::Result;
use crate::layout::{Layout, Rank};
use crate::workqueue::Task;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identifies one registered transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitId(pub u64);

/// A single precondition in a wait-set: a datum, optionally at a subscript.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitInput {
    /// Datum id.
    pub id: u64,
    /// Subscript, if waiting on a subscript rather than the whole datum.
    pub sub: Option<Subscript>,
}

struct PendingTask {
    remaining: HashSet<WaitInput>,
    task: Task,
}

/// Per-server dependency engine.
pub struct DependencyEngine {
    rank: Rank,
    next_wait_id: u64,
    pending: HashMap<WaitId, PendingTask>,
    /// Reverse index: which records are waiting on a given input.
    by_input: HashMap<WaitInput, HashSet<WaitId>>,
    /// Tasks whose full wait-set has fired, not yet drained into the work
    /// queue (spec §4.9 "ready-work array").
    ready: Vec<Task>,
}

impl DependencyEngine {
    /// An empty engine for server `rank`.
    pub fn new(rank: Rank) -> Self {
        DependencyEngine {
            rank,
            next_wait_id: 0,
            pending: HashMap::new(),
            by_input: HashMap::new(),
            ready: Vec::new(),
        }
    }

    fn alloc_wait_id(&mut self) -> WaitId {
        let id = WaitId(self.next_wait_id);
        self.next_wait_id += 1;
        id
    }

    /// Register `task` behind `inputs`. `already_set` is called once per
    /// input to check (and, on the local fast path, subscribe against)
    /// the home data store; each closure invocation returns whether the
    /// input has already fired. Subscribing to a remotely-homed datum is
    /// the caller's responsibility (forward a `SyncMode::Subscribe`); this
    /// engine only tracks the remaining count and the eventual release.
    ///
    /// An empty wait-set releases the task immediately.
    pub fn register(&mut self, task: Task, inputs: Vec<WaitInput>, mut already_set: impl FnMut(&WaitInput) -> bool) -> Option<WaitId> {
        let remaining: HashSet<WaitInput> = inputs.into_iter().filter(|i| !already_set(i)).collect();
        if remaining.is_empty() {
            self.ready.push(task);
            return None;
        }
        let wait_id = self.alloc_wait_id();
        for input in &remaining {
            self.by_input.entry(input.clone()).or_default().insert(wait_id);
        }
        self.pending.insert(wait_id, PendingTask { remaining, task });
        Some(wait_id)
    }

    /// Register a task against `local` store preconditions directly,
    /// subscribing into the listener tree for any not already satisfied
    /// (the local fast path, spec §4.9: "notifications generated
    /// server-side that target the server's own engine take a local fast
    /// path").
    pub fn register_local(
        &mut self,
        store: &mut DataStore,
        task: Task,
        inputs: Vec<WaitInput>,
        work_type_for_wait: i32,
    ) -> Result<Option<WaitId>> {
        let rank = self.rank;
        let mut checked = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let sub = input.sub.as_deref();
            let exists = store.exists(input.id, sub, crate::data::RefDelta::NONE)?;
            checked.push(exists);
        }
        let mut idx = 0;
        let wait_id = self.register(task, inputs.clone(), |_| {
            let present = checked[idx];
            idx += 1;
            present
        });
        if let Some(wait_id) = wait_id {
            for input in &inputs {
                let sub = input.sub.as_deref();
                if store.exists(input.id, sub, crate::data::RefDelta::NONE)? {
                    continue;
                }
                store.subscribe(input.id, sub, rank, work_type_for_wait)?;
            }
        }
        Ok(wait_id)
    }

    /// Record that `input` has fired, releasing any transition record
    /// whose wait-set is now fully satisfied. Called from the local fast
    /// path directly, or after a `SyncMode::Notify` arrives for a
    /// remotely-homed precondition.
    pub fn satisfy(&mut self, input: &WaitInput) {
        let Some(waiters) = self.by_input.remove(input) else { return };
        for wait_id in waiters {
            if let Some(pending) = self.pending.get_mut(&wait_id) {
                pending.remaining.remove(input);
                if pending.remaining.is_empty() {
                    let done = self.pending.remove(&wait_id).expect("just matched");
                    self.ready.push(done.task);
                }
            }
        }
    }

    /// Drain the ready-work array, handing every released task to the
    /// caller in one batch (spec §4.10 step 4). Never called from within
    /// `satisfy` itself.
    pub fn drain_ready(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.ready)
    }

    /// Number of transition records still pending (for tests/metrics).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Determine, for an input, whether its home server is `local_rank`
/// (spec §4.9 local fast path vs. forwarded subscribe).
pub fn is_local(layout: &Layout, local_rank: Rank, input: &WaitInput) -> bool {
    layout.locate(input.id) == local_rank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CreateProps, DatumType, RefDelta};
    use crate::layout::{HostId, Layout};
    use crate::workqueue::Target;

    fn task() -> Task {
        Task { ty: 0, priority: 1, parallelism: 1, target: Target::Any, answer_rank: 0, payload: b"X".to_vec() }
    }

    #[test]
    fn empty_wait_set_releases_immediately() {
        let mut engine = DependencyEngine::new(0);
        let released = engine.register(task(), Vec::new(), |_| false);
        assert!(released.is_none());
        assert_eq!(engine.drain_ready().len(), 1);
    }

    #[test]
    fn release_exactly_once_after_all_inputs_fire_e3() {
        let layout = Layout::new(4, 1, |_| 0 as HostId);
        let mut store = DataStore::new(layout.first_server(), 1);
        let id = store.create(Some(20), DatumType::Integer, CreateProps::default_counts()).unwrap();

        let mut engine = DependencyEngine::new(layout.first_server());
        let wait_id = engine
            .register_local(&mut store, task(), vec![WaitInput { id, sub: None }], 0)
            .unwrap();
        assert!(wait_id.is_some());
        assert_eq!(engine.drain_ready().len(), 0);

        let notif = store
            .store(id, None, DatumType::Integer, b"0", RefDelta { read: 0, write: -1 }, crate::data::RefCounts::default())
            .unwrap();
        for (rank, fired_id, sub, _ty) in &notif.notify {
            assert_eq!(*rank, layout.first_server());
            engine.satisfy(&WaitInput { id: *fired_id, sub: if sub.is_empty() { None } else { Some(sub.clone()) } });
        }

        let released = engine.drain_ready();
        assert_eq!(released.len(), 1);
        assert_eq!(engine.pending_count(), 0);
        // Draining again must not re-release the same task.
        assert_eq!(engine.drain_ready().len(), 0);
    }

    #[test]
    fn two_preconditions_release_only_after_both_fire() {
        let mut store = DataStore::new(0, 1);
        let a = store.create(Some(1), DatumType::Integer, CreateProps::default_counts()).unwrap();
        let b = store.create(Some(2), DatumType::Integer, CreateProps::default_counts()).unwrap();
        let mut engine = DependencyEngine::new(0);
        engine
            .register_local(&mut store, task(), vec![WaitInput { id: a, sub: None }, WaitInput { id: b, sub: None }], 0)
            .unwrap();

        engine.satisfy(&WaitInput { id: a, sub: None });
        assert_eq!(engine.drain_ready().len(), 0);
        engine.satisfy(&WaitInput { id: b, sub: None });
        assert_eq!(engine.drain_ready().len(), 1);
    }
}
