//! The server loop (spec §4.10)
//!
//! `ServerContext` owns every other component (C1-C9) plus `Config` and
//! drives the six-step loop body. The lowest-ranked server is the
//! **master**: it alone runs the idle-check round that leads to global
//! shutdown.
//!
//! The sync effect logic below is written as free functions rather than
//! `&mut self` methods: `SyncEngine::poll_incoming`/`do_sync`/
//! `drain_deferred` each hand the caller a handler closure to run while
//! `sync` itself is mutably borrowed, so the closure must touch only the
//! *other* fields. Destructuring `self` once per call site into disjoint
//! `&mut` bindings is what lets the borrow checker see that.

use crate::backoff::Backoff;
use crate::client::{ClientOp, ClientReply, RequestEnvelope, ResponseEnvelope};
use crate::config::Config;
use crate::data::{DataStore, NotifSet};
use crate::dependency::{DependencyEngine, WaitInput};
use crate::error::Result;
use crate::layout::{Layout, Rank};
use crate::messaging::{MessageHeader, Tag, Transport};
use crate::requestqueue::RequestQueue;
use crate::steal::{StealChunk, StealConfig, StealEngine};
use crate::sync::{send_oneshot_from, PollOutcome, SyncEngine, SyncMode};
use crate::workqueue::{Accuracy, Strictness, Target, Task, WorkQueue};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// What happened during one call to `ServerContext::step`.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Some unit of work was performed (a message dispatched, deferred
    /// item drained, or ready task released).
    Active,
    /// Nothing happened this iteration; the caller should back off.
    Idle,
    /// A shutdown sync was observed or issued; the loop should stop.
    ShutdownObserved,
}

/// State of the master's in-flight idle-check round.
struct IdleRound {
    serial: u64,
    peers: Vec<Rank>,
    next_peer: usize,
    all_idle_so_far: bool,
    work_counts: HashMap<i32, HashMap<Rank, u32>>,
    request_counts: HashMap<i32, HashMap<Rank, u32>>,
}

/// Owns every subsystem for one server rank and drives its loop.
pub struct ServerContext<T: Transport> {
    rank: Rank,
    layout: Layout,
    config: Config,
    transport: T,
    data: DataStore,
    work: WorkQueue,
    requests: RequestQueue,
    sync: SyncEngine,
    steal: StealEngine,
    dependency: DependencyEngine,
    poll_backoff: Backoff,
    last_activity: Instant,
    idle_round: Option<IdleRound>,
    shutdown_complete: bool,
    /// Correlation ids of blocking `Get`s registered in `requests` but not
    /// yet matched to work, keyed by the same `(rank, ty)` pair `requests`
    /// coalesces on, FIFO per pair (spec §5 Ordering: "Asynchronous Gets
    /// posted by one worker are filled in the order they were posted").
    pending_get_corr: HashMap<(Rank, i32), VecDeque<u64>>,
}

fn work_counts(work: &WorkQueue) -> Vec<(i32, u32)> {
    work.active_types().into_iter().map(|ty| (ty, work.count(ty) as u32)).collect()
}

fn request_counts(requests: &RequestQueue) -> Vec<(i32, u32)> {
    requests.active_types().into_iter().map(|ty| (ty, requests.count(ty))).collect()
}

fn locally_idle(
    layout: &Layout,
    rank: Rank,
    requests: &RequestQueue,
    dependency: &DependencyEngine,
    last_activity: Instant,
    max_idle: Duration,
) -> bool {
    let local_workers = layout.workers_for_server(rank - layout.first_server());
    let worker_count = (local_workers.end - local_workers.start).max(0) as u32;
    let no_busy_workers = worker_count == 0 || requests.all_workers_blocked(worker_count);
    let no_pending_notifications = dependency.pending_count() == 0;
    let inactive_long_enough = last_activity.elapsed() >= max_idle;
    no_busy_workers && no_pending_notifications && inactive_long_enough
}

fn ship_stolen_tasks(rank: Rank, transport: &impl Transport, to: Rank, tasks: Vec<Task>) {
    let chunks = StealEngine::chunk_plan(tasks.len() as u32);
    let mut rest = tasks;
    for (n, last) in chunks {
        let tail = rest.split_off((n as usize).min(rest.len()));
        let chunk = StealChunk { tasks: rest, last };
        rest = tail;
        if let Ok(bytes) = bincode::serialize(&chunk) {
            let (header, big) = MessageHeader::new(rank, to, Tag::Payload, &bytes);
            let _ = transport.send(to, header, big);
        }
    }
}

/// Fold a freshly produced `NotifSet` through the fixpoint drain and ship
/// every resulting notify either straight into the local work queue (the
/// subscriber's home server is us) or onward via `DeliverNotify`.
fn apply_and_dispatch_notifications(
    rank: Rank,
    layout: &Layout,
    transport: &impl Transport,
    data: &mut DataStore,
    work: &mut WorkQueue,
    notif: NotifSet,
) {
    match crate::notify::drain(data, notif) {
        Ok(outbound) => {
            for out in outbound {
                let home = layout.server_for_worker(out.rank);
                if home == rank {
                    work.put(
                        layout,
                        Task {
                            ty: out.work_type,
                            priority: i64::MAX,
                            parallelism: 1,
                            target: Target::Rank(out.rank, Strictness::Hard, Accuracy::Rank),
                            answer_rank: out.rank,
                            payload: out.payload.into_bytes(),
                        },
                    );
                } else {
                    let _ = send_oneshot_from(
                        rank,
                        transport,
                        home,
                        SyncMode::DeliverNotify { rank: out.rank, work_type: out.work_type, payload: out.payload.into_bytes() },
                    );
                }
            }
        }
        Err(e) => trace!(error = %e, "notification drain failed"),
    }
}

/// Apply an accepted sync's effect locally, returning the accept payload
/// for modes that require one (spec §4.3's `service`, plumbed through
/// `SyncEngine`'s handler callback).
#[allow(clippy::too_many_arguments)]
fn apply_sync_effect(
    rank: Rank,
    layout: &Layout,
    transport: &impl Transport,
    data: &mut DataStore,
    work: &mut WorkQueue,
    requests: &RequestQueue,
    dependency: &mut DependencyEngine,
    steal: &StealEngine,
    last_activity: &mut Instant,
    max_idle: Duration,
    from: Rank,
    mode: SyncMode,
) -> Option<SyncMode> {
    *last_activity = Instant::now();
    match mode {
        SyncMode::Request => Some(SyncMode::Request),
        SyncMode::StealProbe => Some(SyncMode::StealProbeResp { counts: work_counts(work) }),
        SyncMode::StealProbeResp { .. } => None,
        SyncMode::Steal { counts, .. } => {
            let peer_counts: HashMap<i32, u32> = counts.into_iter().collect();
            let my_counts: HashMap<i32, u32> = work_counts(work).into_iter().collect();
            let my_requests: HashMap<i32, u32> = request_counts(requests).into_iter().collect();
            let plan = steal.decide(&my_counts, &my_requests, &peer_counts);
            let mut granted = Vec::new();
            let mut stolen = Vec::new();
            for (ty, amount) in plan {
                let mut taken = 0;
                for _ in 0..amount {
                    match work.pop_for(layout, from, ty) {
                        Some(task) => {
                            stolen.push(task);
                            taken += 1;
                        }
                        None => break,
                    }
                }
                if taken > 0 {
                    granted.push((ty, taken));
                }
            }
            ship_stolen_tasks(rank, transport, from, stolen);
            Some(SyncMode::StealProbeResp { counts: granted })
        }
        SyncMode::Refcount { id, delta } | SyncMode::RefcountWait { id, delta } => {
            match data.refcount_incr(id, delta) {
                Ok(notif) => apply_and_dispatch_notifications(rank, layout, transport, data, work, notif),
                Err(e) => trace!(error = %e, "refcount sync failed"),
            }
            None
        }
        SyncMode::Subscribe { id, sub, rank: subscriber, work_type } => {
            match data.subscribe(id, sub.as_deref(), subscriber, work_type) {
                Ok(true) => {}
                Ok(false) => {
                    let payload = match &sub {
                        Some(s) => format!("close {id} {}", String::from_utf8_lossy(s)),
                        None => format!("close {id}"),
                    };
                    let _ = send_oneshot_from(
                        rank,
                        transport,
                        subscriber,
                        SyncMode::DeliverNotify { rank: subscriber, work_type, payload: payload.into_bytes() },
                    );
                }
                Err(e) => trace!(error = %e, "forwarded subscribe failed"),
            }
            None
        }
        SyncMode::Notify { id, sub } => {
            dependency.satisfy(&WaitInput { id, sub });
            None
        }
        SyncMode::DeliverNotify { rank: target, work_type, payload } => {
            work.put(
                layout,
                Task {
                    ty: work_type,
                    priority: i64::MAX,
                    parallelism: 1,
                    target: Target::Rank(target, Strictness::Hard, Accuracy::Rank),
                    answer_rank: target,
                    payload,
                },
            );
            None
        }
        SyncMode::Shutdown => None,
        SyncMode::IdleQuery { serial } => {
            let idle = locally_idle(layout, rank, requests, dependency, *last_activity, max_idle);
            Some(SyncMode::IdleReport {
                serial,
                idle,
                work_counts: work_counts(work),
                request_counts: request_counts(requests),
            })
        }
        SyncMode::IdleReport { .. } => None,
    }
}

/// Apply a worker-originated `ClientOp` against local state, returning its
/// reply. `DPut`, `Get`, and `Fail` are handled by `ServerContext::
/// dispatch_client_op` directly instead (they need `submit_dput`'s
/// cross-server forwarding, may defer, or drive shutdown, respectively) and
/// never reach this function.
fn apply_client_op(
    rank: Rank,
    layout: &Layout,
    transport: &impl Transport,
    data: &mut DataStore,
    work: &mut WorkQueue,
    from: Rank,
    op: ClientOp,
) -> ClientReply {
    match op {
        ClientOp::Put { task } => {
            work.put(layout, task);
            ClientReply::Ack
        }
        ClientOp::Create { id, dtype, props } => match data.create(id, dtype, props) {
            Ok(new_id) => ClientReply::Id(new_id),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Unique => ClientReply::Id(data.unique()),
        ClientOp::AllocGlobal { count } => ClientReply::Id(data.alloc_global(count)),
        ClientOp::Store { id, sub, dtype, bytes, decr, store_refs } => {
            match data.store(id, sub.as_deref(), dtype, &bytes, decr, store_refs) {
                Ok(notif) => {
                    apply_and_dispatch_notifications(rank, layout, transport, data, work, notif);
                    ClientReply::Ack
                }
                Err(e) => ClientReply::Err(e.to_string()),
            }
        }
        ClientOp::Retrieve { id, sub, decr, incr_referand } => match data.retrieve(id, sub.as_deref(), decr, incr_referand) {
            Ok((dtype, bytes)) => ClientReply::Bytes(dtype, bytes),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Exists { id, sub, decr } => match data.exists(id, sub.as_deref(), decr) {
            Ok(b) => ClientReply::Bool(b),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Enumerate { id, count, offset, want_keys, want_vals, decr } => {
            match data.enumerate(id, count, offset, want_keys, want_vals, decr) {
                Ok(entries) => ClientReply::Entries(entries),
                Err(e) => ClientReply::Err(e.to_string()),
            }
        }
        ClientOp::InsertAtomic { id, sub, refcounts } => match data.insert_atomic(id, &sub, refcounts) {
            Ok(r) => ClientReply::InsertAtomic { created: r.created, present: r.present, value: r.value },
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Subscribe { id, sub, work_type } => match data.subscribe(id, sub.as_deref(), from, work_type) {
            Ok(b) => ClientReply::Bool(b),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::ContainerReference { id, sub, ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr } => {
            match data.container_reference(id, &sub, ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr) {
                Ok(notif) => {
                    apply_and_dispatch_notifications(rank, layout, transport, data, work, notif);
                    ClientReply::Ack
                }
                Err(e) => ClientReply::Err(e.to_string()),
            }
        }
        ClientOp::RefcountIncr { id, delta } => match data.refcount_incr(id, delta) {
            Ok(notif) => {
                apply_and_dispatch_notifications(rank, layout, transport, data, work, notif);
                ClientReply::Ack
            }
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::RefcountGet { id, decr } => match data.refcount_get(id, decr) {
            Ok((r, w)) => ClientReply::Refcounts(r, w),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::ReadRefcountEnable => {
            data.enable_read_refcount();
            ClientReply::Ack
        }
        ClientOp::Permanent { id } => match data.mark_permanent(id) {
            Ok(()) => ClientReply::Ack,
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Lock { id } => match data.lock(id, from) {
            Ok(b) => ClientReply::Bool(b),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::Unlock { id } => match data.unlock(id) {
            Ok(()) => ClientReply::Ack,
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::TypeOf { id } => match data.typeof_datum(id) {
            Ok(t) => ClientReply::DatumType(t),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::ContainerTypeOf { id } => match data.container_val_type(id) {
            Ok(t) => ClientReply::DatumType(t),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::ContainerSize { id } => match data.container_size(id) {
            Ok(s) => ClientReply::Size(s),
            Err(e) => ClientReply::Err(e.to_string()),
        },
        ClientOp::DPut { .. } | ClientOp::Get { .. } | ClientOp::Fail { .. } => {
            unreachable!("DPut/Get/Fail are dispatched before apply_client_op")
        }
    }
}

impl<T: Transport> ServerContext<T> {
    /// Build a fresh server context for `rank` under `layout`/`config`,
    /// speaking over `transport`.
    pub fn new(rank: Rank, layout: Layout, config: Config, transport: T) -> Self {
        let servers = layout.servers();
        let deferred_cap = config.deferred_sync_buffer_size;
        let steal_cfg = StealConfig {
            concurrency_limit: config.steal_concurrency_limit,
            rate_limit: config.steal_rate_limit,
            backoff: config.steal_backoff,
            servers,
        };
        ServerContext {
            rank,
            layout,
            config,
            transport,
            data: DataStore::new(rank, servers),
            work: WorkQueue::new(),
            requests: RequestQueue::new(),
            sync: SyncEngine::new(rank, deferred_cap),
            steal: StealEngine::new(steal_cfg),
            dependency: DependencyEngine::new(rank),
            poll_backoff: Backoff::default_poll(),
            last_activity: Instant::now(),
            idle_round: None,
            shutdown_complete: false,
            pending_get_corr: HashMap::new(),
        }
    }

    /// This server's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether this server is the master (lowest-ranked server, spec
    /// §4.10).
    pub fn is_master(&self) -> bool {
        self.rank == self.layout.first_server()
    }

    /// Whether a full shutdown round has completed and the loop should
    /// stop calling `step`.
    pub fn shutdown_complete(&self) -> bool {
        self.shutdown_complete
    }

    /// The delay the caller should sleep before the next `step` call,
    /// per the adaptive back-off counter.
    pub fn backoff_delay(&self) -> Duration {
        self.poll_backoff.current_delay()
    }

    /// Register a `dput` locally: release immediately if the wait-set is
    /// already satisfied, otherwise subscribe to every precondition
    /// (forwarding to the owning server for inputs not homed here).
    pub fn submit_dput(&mut self, task: Task, inputs: Vec<WaitInput>, work_type_for_wait: i32) -> Result<()> {
        let all_local = inputs.iter().all(|i| self.layout.locate(i.id) == self.rank);
        if all_local {
            self.dependency.register_local(&mut self.data, task, inputs, work_type_for_wait)?;
            return Ok(());
        }
        let wait_id = self.dependency.register(task, inputs.clone(), |_| false);
        if wait_id.is_some() {
            for input in inputs {
                let home = self.layout.locate(input.id);
                if home == self.rank {
                    if self.data.exists(input.id, input.sub.as_deref(), crate::data::RefDelta::NONE)? {
                        self.dependency.satisfy(&input);
                    } else {
                        self.data.subscribe(input.id, input.sub.as_deref(), self.rank, work_type_for_wait)?;
                    }
                } else {
                    self.sync.send_oneshot(
                        &self.transport,
                        home,
                        SyncMode::Subscribe { id: input.id, sub: input.sub, rank: self.rank, work_type: work_type_for_wait },
                    )?;
                }
            }
        }
        Ok(())
    }

    /// One iteration of the six-step loop body (spec §4.10).
    pub fn step(&mut self) -> Result<StepOutcome> {
        let mut active = false;
        let rank = self.rank;
        let max_idle = self.config.max_idle;

        // 1. Peek/dispatch the next incoming sync.
        {
            let ServerContext { layout, transport, data, work, requests, dependency, steal, last_activity, sync, .. } = self;
            let outcome = sync.poll_incoming(transport, |from, mode| {
                apply_sync_effect(rank, layout, transport, data, work, requests, dependency, steal, last_activity, max_idle, from, mode)
            })?;
            if !matches!(outcome, PollOutcome::Idle) {
                active = true;
            }
        }
        if self.sync.shutdown_seen() {
            self.finish_shutdown();
            return Ok(StepOutcome::ShutdownObserved);
        }

        // 2. Probe the generic message queue for any other tag (spec
        // §4.10 step 2's "handler table"): steal-chunk payloads and the
        // worker-facing client RPC surface.
        if self.drain_stolen_chunks() {
            active = true;
        }
        if self.poll_client_requests()? {
            active = true;
        }

        // 3. Drain one deferred sync.
        {
            let ServerContext { layout, transport, data, work, requests, dependency, steal, last_activity, sync, .. } = self;
            let mut handler = |from: Rank, mode: SyncMode| {
                apply_sync_effect(rank, layout, transport, data, work, requests, dependency, steal, last_activity, max_idle, from, mode)
            };
            if sync.drain_deferred(transport, &mut handler)? {
                active = true;
            }
        }

        // 4. Drain the ready-work array from the dependency engine, then
        // match any freshly available work against workers already
        // blocked on a Get (the demand `dispatch_client_op` deferred).
        let ready = self.dependency.drain_ready();
        if !ready.is_empty() {
            active = true;
            for task in ready {
                self.work.put(&self.layout, task);
            }
        }
        if self.match_pending_gets() {
            active = true;
        }
        if self.match_pending_parallel() {
            active = true;
        }

        // 5/6. Back-off bookkeeping; idle-round progress lives outside the
        // strict six steps but is driven from the same loop body.
        if active {
            self.poll_backoff.record_success();
            self.last_activity = Instant::now();
        } else {
            self.poll_backoff.record_failure();
        }

        if self.is_master()
            && self.idle_round.is_none()
            && locally_idle(&self.layout, rank, &self.requests, &self.dependency, self.last_activity, max_idle)
        {
            self.begin_idle_round();
        } else if self.idle_round.is_some() {
            self.advance_idle_round()?;
        }

        Ok(if active { StepOutcome::Active } else { StepOutcome::Idle })
    }

    /// Drain and dispatch every pending `Tag::ClientRequest`.
    fn poll_client_requests(&mut self) -> Result<bool> {
        let mut any = false;
        while let Some(msg) = self.transport.try_recv(Some(Tag::ClientRequest)) {
            any = true;
            let bytes = msg.big_payload.unwrap_or(msg.header.inline);
            let Ok(env): std::result::Result<RequestEnvelope, _> = bincode::deserialize(&bytes) else { continue };
            self.dispatch_client_op(msg.header.src, env.corr, env.op)?;
        }
        Ok(any)
    }

    /// Route one `ClientOp` from worker `from` to its handling, replying
    /// immediately unless it is a blocking `Get` with no task available yet.
    fn dispatch_client_op(&mut self, from: Rank, corr: u64, op: ClientOp) -> Result<()> {
        match op {
            ClientOp::DPut { task, inputs, work_type_for_wait } => {
                self.submit_dput(task, inputs, work_type_for_wait)?;
                self.reply(from, corr, ClientReply::Ack);
            }
            ClientOp::Get { ty, blocking } => {
                if let Some(task) = self.work.pop_for(&self.layout, from, ty) {
                    self.reply(from, corr, ClientReply::Task(task));
                } else if blocking {
                    self.requests.add(from, ty, 1, true);
                    self.pending_get_corr.entry((from, ty)).or_default().push_back(corr);
                } else {
                    self.reply(from, corr, ClientReply::NoTask);
                }
            }
            ClientOp::Fail { code } => {
                info!(code, from, "worker-reported failure, forcing emergency shutdown");
                let peers: Vec<Rank> = (self.layout.first_server()..self.layout.first_server() + self.layout.servers())
                    .filter(|&r| r != self.rank)
                    .collect();
                for peer in peers {
                    let _ = self.sync.send_oneshot(&self.transport, peer, SyncMode::Shutdown);
                }
                self.finish_shutdown();
                self.reply(from, corr, ClientReply::Ack);
            }
            other => {
                let rank = self.rank;
                let ServerContext { layout, transport, data, work, .. } = self;
                let reply = apply_client_op(rank, layout, transport, data, work, from, other);
                self.reply(from, corr, reply);
            }
        }
        Ok(())
    }

    /// Send a `ClientReply` back as `Tag::ClientResponse`, correlated by
    /// `corr`.
    fn reply(&self, to: Rank, corr: u64, reply: ClientReply) {
        if let Ok(bytes) = bincode::serialize(&ResponseEnvelope { corr, reply }) {
            let (header, big) = MessageHeader::new(self.rank, to, Tag::ClientResponse, &bytes);
            let _ = self.transport.send(to, header, big);
        }
    }

    /// Match freshly available work against workers already blocked on a
    /// `Get`, answering their deferred `Tag::ClientResponse` (spec §4.10,
    /// continuation of step 4). Demand for a type is tried oldest-first; a
    /// requester whose targeting can't be satisfied yet is put back so a
    /// later requester doesn't jump the queue.
    fn match_pending_gets(&mut self) -> bool {
        let mut any = false;
        for ty in self.requests.active_types() {
            loop {
                let Some(rank) = self.requests.take_one(ty) else { break };
                match self.work.pop_for(&self.layout, rank, ty) {
                    Some(task) => {
                        if let Some(corr) = self.pending_get_corr.get_mut(&(rank, ty)).and_then(|q| q.pop_front()) {
                            self.reply(rank, corr, ClientReply::Task(task));
                            any = true;
                        }
                    }
                    None => {
                        self.requests.add(rank, ty, 1, true);
                        break;
                    }
                }
            }
        }
        any
    }

    /// Match a parallel task (parallelism > 1) against a contiguous,
    /// `par_mod`-aligned block of local workers all blocked on the same
    /// type (spec §4.6/§6.3, E5). `WorkQueue::pop_parallel` walks the
    /// parallel list smallest-parallelism-first, asking `RequestQueue` to
    /// confirm a placement exists before committing to it; once popped,
    /// every worker in the matched block has its blocking demand consumed
    /// and receives the same task.
    fn match_pending_parallel(&mut self) -> bool {
        let local_start = self.layout.workers_for_server(self.rank - self.layout.first_server()).start;
        let local_end = self.layout.workers_for_server(self.rank - self.layout.first_server()).end;
        let par_mod = self.config.par_mod;
        let mut replies: Vec<(Rank, u64, ClientReply)> = Vec::new();

        {
            let ServerContext { work, requests, pending_get_corr, .. } = self;
            for ty in work.active_types() {
                loop {
                    let Some(task) = work.pop_parallel(ty, |parallelism| {
                        requests.contiguous_free_block(local_start..local_end, parallelism, par_mod).is_some()
                    }) else {
                        break;
                    };
                    let parallelism = task.parallelism;
                    let Some(start) = requests.contiguous_free_block(local_start..local_end, parallelism, par_mod) else {
                        break;
                    };
                    for r in start..start + parallelism as i32 {
                        requests.remove_one(r, ty);
                        if let Some(corr) = pending_get_corr.get_mut(&(r, ty)).and_then(|q| q.pop_front()) {
                            replies.push((r, corr, ClientReply::Task(task.clone())));
                        }
                    }
                }
            }
        }

        let any = !replies.is_empty();
        for (rank, corr, reply) in replies {
            self.reply(rank, corr, reply);
        }
        any
    }

    fn drain_stolen_chunks(&mut self) -> bool {
        let mut any = false;
        while let Some(msg) = self.transport.try_recv(Some(Tag::Payload)) {
            let bytes = msg.big_payload.unwrap_or(msg.header.inline);
            let Ok(chunk): std::result::Result<StealChunk, _> = bincode::deserialize(&bytes) else { continue };
            any = true;
            let last = chunk.last;
            for task in chunk.tasks {
                self.work.put(&self.layout, task);
            }
            if last {
                break;
            }
        }
        any
    }

    fn begin_idle_round(&mut self) {
        let serial = self.last_activity.elapsed().as_nanos() as u64 ^ (self.rank as u64);
        let peers: Vec<Rank> = (self.layout.first_server()..self.layout.first_server() + self.layout.servers())
            .filter(|&r| r != self.rank)
            .collect();
        info!(serial, peer_count = peers.len(), "master beginning idle-check round");
        self.idle_round = Some(IdleRound {
            serial,
            peers,
            next_peer: 0,
            all_idle_so_far: true,
            work_counts: HashMap::new(),
            request_counts: HashMap::new(),
        });
    }

    fn advance_idle_round(&mut self) -> Result<()> {
        let (peer, serial) = {
            let Some(round) = &self.idle_round else { return Ok(()) };
            if round.next_peer >= round.peers.len() {
                let round = self.idle_round.take().unwrap();
                self.conclude_idle_round(round);
                return Ok(());
            }
            (round.peers[round.next_peer], round.serial)
        };

        let rank = self.rank;
        let max_idle = self.config.max_idle;
        let reply = {
            let ServerContext { layout, transport, data, work, requests, dependency, steal, last_activity, sync, .. } = self;
            let mut handler = |from: Rank, mode: SyncMode| {
                apply_sync_effect(rank, layout, transport, data, work, requests, dependency, steal, last_activity, max_idle, from, mode)
            };
            sync.do_sync(transport, peer, SyncMode::IdleQuery { serial }, &mut handler)?
        };

        let Some(round) = &mut self.idle_round else { return Ok(()) };
        match reply {
            Some(SyncMode::IdleReport { serial: got, idle, work_counts, request_counts }) if got == serial => {
                round.all_idle_so_far &= idle;
                for (ty, count) in work_counts {
                    round.work_counts.entry(ty).or_default().insert(peer, count);
                }
                for (ty, count) in request_counts {
                    round.request_counts.entry(ty).or_default().insert(peer, count);
                }
                round.next_peer += 1;
            }
            _ => {
                // Cancelled sync or a reply from a superseded round:
                // invalidate and let the next locally-idle check restart.
                self.idle_round = None;
            }
        }
        Ok(())
    }

    fn conclude_idle_round(&mut self, round: IdleRound) {
        let self_idle = locally_idle(&self.layout, self.rank, &self.requests, &self.dependency, self.last_activity, self.config.max_idle);
        if !round.all_idle_so_far || !self_idle {
            return;
        }
        let cross_matchable = round.work_counts.keys().any(|ty| {
            let has_work = round.work_counts.get(ty).map(|m| m.values().any(|&c| c > 0)).unwrap_or(false);
            let has_request_elsewhere = round.request_counts.get(ty).map(|m| m.values().any(|&c| c > 0)).unwrap_or(false);
            has_work && has_request_elsewhere
        });
        if cross_matchable {
            return;
        }
        info!(serial = round.serial, "global idle confirmed, declaring shutdown");
        for &peer in &round.peers {
            let _ = self.sync.send_oneshot(&self.transport, peer, SyncMode::Shutdown);
        }
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        for (id, diagnostic) in self.data.unresolved_at_finalize() {
            warn!(rank = self.rank, id, diagnostic, "unresolved listener at finalize");
        }
        if self.config.report_leaks {
            let live = self.data.live_count();
            if live > 0 {
                warn!(rank = self.rank, live, "ADLB_REPORT_LEAKS: unfreed datums at shutdown");
            }
        }

        self.shutdown_complete = true;
        let local_workers = self.layout.workers_for_server(self.rank - self.layout.first_server());
        for worker in local_workers {
            let (header, big) =
                MessageHeader::new(self.rank, worker, Tag::Response(crate::messaging::RequestKind::Shutdown), b"");
            let _ = self.transport.send(worker, header, big);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CreateProps, DatumType, RefDelta};
    use crate::layout::HostId;
    use crate::transport::ChannelMesh;

    fn layout_1w_2s() -> Layout {
        Layout::new(2, 2, |_| 0 as HostId)
    }

    #[test]
    fn single_server_drains_ready_dput_into_work_queue_e3() {
        let layout = layout_1w_2s();
        let (_mesh, mut transports) = ChannelMesh::new(&[0, 1, 2]);
        let t2 = transports.pop().unwrap();
        let mut ctx = ServerContext::new(2, layout.clone(), Config::default(), t2);

        let id = ctx.data.create(Some(20), DatumType::Integer, CreateProps::default_counts()).unwrap();
        let task = Task { ty: 0, priority: 1, parallelism: 1, target: Target::Any, answer_rank: 0, payload: b"X".to_vec() };
        ctx.submit_dput(task, vec![WaitInput { id, sub: None }], 0).unwrap();

        assert_eq!(ctx.work.active_types().len(), 0);
        let notif = ctx
            .data
            .store(id, None, DatumType::Integer, b"0", RefDelta { read: 0, write: -1 }, crate::data::RefCounts::default())
            .unwrap();
        for (fired_rank, fired_id, sub, _ty) in &notif.notify {
            assert_eq!(*fired_rank, 2);
            ctx.dependency.satisfy(&WaitInput { id: *fired_id, sub: if sub.is_empty() { None } else { Some(sub.clone()) } });
        }
        let ready = ctx.dependency.drain_ready();
        assert_eq!(ready.len(), 1);
        for t in ready {
            ctx.work.put(&layout, t);
        }
        assert_eq!(ctx.work.count(0), 1);
    }

    #[test]
    fn master_declares_shutdown_when_all_idle_and_no_cross_work() {
        // One worker (rank 0) so the layout is valid; servers occupy [1, 3).
        let layout = Layout::new(1, 2, |_| 0 as HostId);
        let mut config = Config::default();
        config.max_idle = Duration::from_secs(0);

        let (_mesh, mut transports) = ChannelMesh::new(&[1, 2]);
        let t2 = transports.pop().unwrap();
        let t1 = transports.pop().unwrap();

        let mut master = ServerContext::new(1, layout.clone(), config.clone(), t1);
        let mut peer = ServerContext::new(2, layout, config, t2);
        // Master's one local worker is blocked on a Get, i.e. idle.
        master.requests.add(0, 0, 1, true);

        assert!(master.is_master());
        assert!(!peer.is_master());

        // `advance_idle_round` blocks inside `do_sync` until the peer
        // replies, so the peer must be driven from its own thread rather
        // than interleaved single-threaded steps.
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done_peer = done.clone();
        let peer_thread = std::thread::spawn(move || {
            while !done_peer.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = peer.step();
                std::thread::yield_now();
            }
        });

        for _ in 0..2000 {
            if master.shutdown_complete() {
                break;
            }
            let _ = master.step().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Relaxed);
        peer_thread.join().unwrap();

        assert!(master.shutdown_complete());
    }
}
