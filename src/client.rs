//! Worker-facing API (spec §6.1)
//!
//! A thin RPC client over `Transport`: every call serializes a `ClientOp`,
//! sends it to the right server as `Tag::ClientRequest`, and blocks on
//! `Tag::ClientResponse` for the matching reply. The destination is always
//! computed locally via `Layout` - `locate(id)` for datum-addressed ops,
//! `server_for_worker(rank)` (this worker's own home server) for
//! `Get`/`DPut`/`Create(id=None)`/`Unique`/`AllocGlobal` - so no server ever
//! forwards a client request on this worker's behalf.
//!
//! Replies are correlated by a per-call sequence number rather than by
//! message order, since a pipelined `aget` may still be outstanding when
//! later synchronous calls (store, retrieve, ...) round-trip to other
//! servers and land on the same `Tag::ClientResponse` tag. Replies that
//! don't match what we're currently waiting for are buffered in `backlog`
//! (the same buffer-on-mismatch idea `ChannelTransport` uses for tags).

use crate::data::{CreateProps, DatumType, InsertAtomicResult, RefCounts, RefDelta, Subscript};
use crate::dependency::WaitInput;
use crate::error::{AdlbError, Result};
use crate::layout::{Layout, Rank};
use crate::messaging::{MessageHeader, Tag, Transport};
use crate::workqueue::{Accuracy, Strictness, Target, Task};
use serde::{Deserialize, Serialize};

/// One worker-facing operation, wire-encoded as the payload of a
/// `Tag::ClientRequest` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientOp {
    /// `put(payload, length, target, answer, type, opts)`.
    Put { task: Task },
    /// `dput(..., wait_ids[], wait_id_subs[])`.
    DPut { task: Task, inputs: Vec<WaitInput>, work_type_for_wait: i32 },
    /// `get(type)` / `iget(type)`, distinguished by `blocking`.
    Get { ty: i32, blocking: bool },
    /// `create(id?, type, extra, props)`; `props.field_types` carries
    /// `extra` for compound types.
    Create { id: Option<u64>, dtype: DatumType, props: CreateProps },
    /// `unique()`.
    Unique,
    /// `alloc_global(count)`.
    AllocGlobal { count: u64 },
    /// `store(id, sub?, type, bytes, decr, store_refs)`.
    Store { id: u64, sub: Option<Subscript>, dtype: DatumType, bytes: Vec<u8>, decr: RefDelta, store_refs: RefCounts },
    /// `retrieve(id, sub?, decr, incr_referand)`.
    Retrieve { id: u64, sub: Option<Subscript>, decr: RefDelta, incr_referand: RefDelta },
    /// `exists(id, sub?, decr)`.
    Exists { id: u64, sub: Option<Subscript>, decr: RefDelta },
    /// `enumerate(id, count, offset, want_keys, want_vals, decr)`.
    Enumerate { id: u64, count: i64, offset: i64, want_keys: bool, want_vals: bool, decr: RefDelta },
    /// `insert_atomic(id, sub, refcounts)`.
    InsertAtomic { id: u64, sub: Subscript, refcounts: RefCounts },
    /// `subscribe(id, sub?, rank, work_type)`; `rank` is implicitly the caller.
    Subscribe { id: u64, sub: Option<Subscript>, work_type: i32 },
    /// `container_reference(id, sub, ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr)`.
    ContainerReference {
        id: u64,
        sub: Subscript,
        ref_id: u64,
        ref_sub: Subscript,
        ref_type: DatumType,
        transfer_refs: RefCounts,
        ref_write_decr: i64,
    },
    /// `refcount_incr(id, delta)`.
    RefcountIncr { id: u64, delta: RefDelta },
    /// `refcount_get(id, decr)`.
    RefcountGet { id: u64, decr: RefDelta },
    /// `read_refcount_enable()`: turn on read-refcount tracking job-wide.
    ReadRefcountEnable,
    /// `permanent(id)`: exempt `id` from garbage collection.
    Permanent { id: u64 },
    /// `lock(id, rank)`.
    Lock { id: u64 },
    /// `unlock(id)`.
    Unlock { id: u64 },
    /// `typeof(id)`.
    TypeOf { id: u64 },
    /// `container_typeof(id)`.
    ContainerTypeOf { id: u64 },
    /// `container_size(id)`.
    ContainerSize { id: u64 },
    /// `fail(code)` / `abort(code)`: tell the home server to drive the job
    /// straight into emergency shutdown, bypassing the idle-check round
    /// (spec §5 "Shutdown safety: after fail(c), no worker is left blocked
    /// on a Get").
    Fail { code: i32 },
}

/// The reply to a `ClientOp`, wire-encoded as the payload of a
/// `Tag::ClientResponse` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    /// A void call succeeded.
    Ack,
    /// `get`/`aget_wait` matched a task.
    Task(Task),
    /// `iget`/`aget_test` found nothing yet.
    NoTask,
    /// `create`/`unique`/`alloc_global` minted an id.
    Id(u64),
    /// `retrieve`: the datum's type plus its bytes.
    Bytes(DatumType, Vec<u8>),
    /// `exists`/`subscribe`/`lock`.
    Bool(bool),
    /// `insert_atomic`.
    InsertAtomic { created: bool, present: bool, value: Option<Vec<u8>> },
    /// `enumerate`.
    Entries(Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>),
    /// `refcount_get`: `(read, write)`.
    Refcounts(i64, i64),
    /// `typeof`/`container_typeof`.
    DatumType(DatumType),
    /// `container_size`.
    Size(usize),
    /// The call failed; carries `AdlbError`'s display text since the error
    /// type itself isn't wire-encoded.
    Err(String),
}

/// Envelope correlating a request/response pair so replies can be matched
/// out of order (needed for pipelined `aget`/`amget`). `server.rs` decodes
/// `RequestEnvelope` and encodes `ResponseEnvelope` directly, including a
/// deferred blocking `Get`'s reply sent long after the request arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub(crate) corr: u64,
    pub(crate) op: ClientOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResponseEnvelope {
    pub(crate) corr: u64,
    pub(crate) reply: ClientReply,
}

/// A handle for a pipelined `aget`, to be polled with `aget_test` or
/// resolved with `aget_wait`.
#[derive(Debug)]
pub struct PendingGet {
    corr: u64,
}

fn reply_error(op: &'static str, reply: ClientReply) -> AdlbError {
    match reply {
        ClientReply::Err(msg) => AdlbError::Unknown(msg),
        other => AdlbError::Unknown(format!("unexpected reply to {op}: {other:?}")),
    }
}

/// The embedded task executor's handle onto the runtime (spec §6.1).
pub struct ClientContext<T: Transport> {
    rank: Rank,
    layout: Layout,
    transport: T,
    next_corr: u64,
    /// Responses received out of correlation order, buffered until the
    /// matching `wait`/`try_take` call for their `corr`.
    backlog: Vec<ResponseEnvelope>,
}

impl<T: Transport> ClientContext<T> {
    /// `init(nservers, ntypes, type_vect, comm)`: bind this worker's client
    /// context to `rank` under `layout`. `am_server`/`worker_comm` partition
    /// in the real MPI runtime has no counterpart here - `layout` already
    /// tells the caller whether a rank is a server (`Layout::is_server`).
    pub fn init(rank: Rank, layout: Layout, transport: T) -> Self {
        ClientContext { rank, layout, transport, next_corr: 0, backlog: Vec::new() }
    }

    /// This worker's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// `locate(id) -> server_rank`: pure, no round-trip (spec §6.1).
    pub fn locate(&self, id: u64) -> Rank {
        self.layout.locate(id)
    }

    fn home_server(&self) -> Rank {
        self.layout.server_for_worker(self.rank)
    }

    fn next_corr(&mut self) -> u64 {
        let corr = self.next_corr;
        self.next_corr += 1;
        corr
    }

    fn post(&mut self, server: Rank, corr: u64, op: ClientOp) -> Result<()> {
        let bytes = bincode::serialize(&RequestEnvelope { corr, op })?;
        let (header, big) = MessageHeader::new(self.rank, server, Tag::ClientRequest, &bytes);
        self.transport.send(server, header, big)
    }

    /// Non-blocking: return the reply for `corr` if it has already arrived,
    /// pulling fresh `Tag::ClientResponse` messages and stashing mismatches.
    fn try_take(&mut self, corr: u64) -> Option<ClientReply> {
        if let Some(pos) = self.backlog.iter().position(|r| r.corr == corr) {
            return Some(self.backlog.remove(pos).reply);
        }
        while let Some(msg) = self.transport.try_recv(Some(Tag::ClientResponse)) {
            let bytes = msg.big_payload.unwrap_or(msg.header.inline);
            let Ok(resp): std::result::Result<ResponseEnvelope, _> = bincode::deserialize(&bytes) else { continue };
            if resp.corr == corr {
                return Some(resp.reply);
            }
            self.backlog.push(resp);
        }
        None
    }

    /// Block until `corr`'s reply arrives (spec §5 "a blocking Get by a
    /// worker" is the only hidden suspension point this covers besides the
    /// adaptive back-off; this spins, matching `SyncEngine::do_sync`'s own
    /// spin-on-transport style rather than parking a real OS thread).
    fn wait(&mut self, corr: u64) -> ClientReply {
        loop {
            if let Some(reply) = self.try_take(corr) {
                return reply;
            }
            std::thread::yield_now();
        }
    }

    fn call(&mut self, server: Rank, op: ClientOp) -> Result<ClientReply> {
        let corr = self.next_corr();
        self.post(server, corr, op)?;
        Ok(self.wait(corr))
    }

    fn call_ack(&mut self, op_name: &'static str, server: Rank, op: ClientOp) -> Result<()> {
        match self.call(server, op)? {
            ClientReply::Ack => Ok(()),
            other => Err(reply_error(op_name, other)),
        }
    }

    /// `put(payload, length, target, answer, type, opts)`.
    pub fn put(&mut self, ty: i32, priority: i64, parallelism: u32, target: Target, answer_rank: Rank, payload: Vec<u8>) -> Result<()> {
        let task = Task { ty, priority, parallelism, target, answer_rank, payload };
        let server = self.home_server();
        self.call_ack("put", server, ClientOp::Put { task })
    }

    /// `dput(..., wait_ids[], wait_id_subs[])`.
    #[allow(clippy::too_many_arguments)]
    pub fn dput(
        &mut self,
        ty: i32,
        priority: i64,
        target: Target,
        answer_rank: Rank,
        payload: Vec<u8>,
        inputs: Vec<WaitInput>,
        work_type_for_wait: i32,
    ) -> Result<()> {
        let task = Task { ty, priority, parallelism: 1, target, answer_rank, payload };
        let server = self.home_server();
        self.call_ack("dput", server, ClientOp::DPut { task, inputs, work_type_for_wait })
    }

    /// `get(type) -> (payload, length, answer, type_recvd, task_comm)`
    /// (blocking; `task_comm` has no counterpart without MPI parallel-task
    /// communicators).
    pub fn get(&mut self, ty: i32) -> Result<Task> {
        let server = self.home_server();
        match self.call(server, ClientOp::Get { ty, blocking: true })? {
            ClientReply::Task(t) => Ok(t),
            other => Err(reply_error("get", other)),
        }
    }

    /// `iget(type) -> (... | NOTHING)` (non-blocking).
    pub fn iget(&mut self, ty: i32) -> Result<Option<Task>> {
        let server = self.home_server();
        match self.call(server, ClientOp::Get { ty, blocking: false })? {
            ClientReply::Task(t) => Ok(Some(t)),
            ClientReply::NoTask => Ok(None),
            other => Err(reply_error("iget", other)),
        }
    }

    /// `aget`: post a blocking Get and return a handle, without waiting.
    pub fn aget(&mut self, ty: i32) -> Result<PendingGet> {
        let server = self.home_server();
        let corr = self.next_corr();
        self.post(server, corr, ClientOp::Get { ty, blocking: true })?;
        Ok(PendingGet { corr })
    }

    /// `amget`: post `n` pipelined Gets at once.
    pub fn amget(&mut self, ty: i32, n: usize) -> Result<Vec<PendingGet>> {
        (0..n).map(|_| self.aget(ty)).collect()
    }

    /// `aget_test`: non-blocking poll of a pending handle.
    pub fn aget_test(&mut self, handle: &PendingGet) -> Result<Option<Task>> {
        match self.try_take(handle.corr) {
            Some(ClientReply::Task(t)) => Ok(Some(t)),
            Some(other) => Err(reply_error("aget_test", other)),
            None => Ok(None),
        }
    }

    /// `aget_wait`: genuinely block until the pending handle resolves.
    pub fn aget_wait(&mut self, handle: PendingGet) -> Result<Task> {
        match self.wait(handle.corr) {
            ClientReply::Task(t) => Ok(t),
            other => Err(reply_error("aget_wait", other)),
        }
    }

    /// `create(id?, type, extra, props)`; `extra` (e.g. a container's
    /// value type) travels as `props.field_types`.
    pub fn create(&mut self, id: Option<u64>, dtype: DatumType, props: CreateProps) -> Result<u64> {
        let server = id.map(|i| self.layout.locate(i)).unwrap_or_else(|| self.home_server());
        match self.call(server, ClientOp::Create { id, dtype, props })? {
            ClientReply::Id(i) => Ok(i),
            other => Err(reply_error("create", other)),
        }
    }

    /// `multicreate`: create several datums in one logical call. This core
    /// has no single-round-trip batching; each spec is issued as its own
    /// `create`.
    pub fn multicreate(&mut self, specs: Vec<(Option<u64>, DatumType, CreateProps)>) -> Result<Vec<u64>> {
        specs.into_iter().map(|(id, dtype, props)| self.create(id, dtype, props)).collect()
    }

    /// `create_integer`.
    pub fn create_integer(&mut self, id: Option<u64>) -> Result<u64> {
        self.create(id, DatumType::Integer, CreateProps::default_counts())
    }

    /// `create_float`.
    pub fn create_float(&mut self, id: Option<u64>) -> Result<u64> {
        self.create(id, DatumType::Float, CreateProps::default_counts())
    }

    /// `create_string`.
    pub fn create_string(&mut self, id: Option<u64>) -> Result<u64> {
        self.create(id, DatumType::String, CreateProps::default_counts())
    }

    /// `create_blob`.
    pub fn create_blob(&mut self, id: Option<u64>) -> Result<u64> {
        self.create(id, DatumType::Blob, CreateProps::default_counts())
    }

    /// `create_container`.
    pub fn create_container(&mut self, id: Option<u64>, val_type: DatumType) -> Result<u64> {
        self.create(id, DatumType::Container, CreateProps { field_types: Some(vec![val_type]), ..CreateProps::default_counts() })
    }

    /// `create_multiset`.
    pub fn create_multiset(&mut self, id: Option<u64>, val_type: DatumType) -> Result<u64> {
        self.create(id, DatumType::Multiset, CreateProps { field_types: Some(vec![val_type]), ..CreateProps::default_counts() })
    }

    /// `create_struct`.
    pub fn create_struct(&mut self, id: Option<u64>, field_types: Vec<DatumType>) -> Result<u64> {
        self.create(id, DatumType::Struct, CreateProps { field_types: Some(field_types), ..CreateProps::default_counts() })
    }

    /// `store(id, sub?, type, bytes, decr, store_refs)`.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        id: u64,
        sub: Option<Subscript>,
        dtype: DatumType,
        bytes: Vec<u8>,
        decr: RefDelta,
        store_refs: RefCounts,
    ) -> Result<()> {
        let server = self.layout.locate(id);
        self.call_ack("store", server, ClientOp::Store { id, sub, dtype, bytes, decr, store_refs })
    }

    /// `retrieve(id, sub?, decr, incr_referand)`.
    pub fn retrieve(&mut self, id: u64, sub: Option<Subscript>, decr: RefDelta, incr_referand: RefDelta) -> Result<(DatumType, Vec<u8>)> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::Retrieve { id, sub, decr, incr_referand })? {
            ClientReply::Bytes(t, b) => Ok((t, b)),
            other => Err(reply_error("retrieve", other)),
        }
    }

    /// `exists(id, sub?, decr)`.
    pub fn exists(&mut self, id: u64, sub: Option<Subscript>, decr: RefDelta) -> Result<bool> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::Exists { id, sub, decr })? {
            ClientReply::Bool(b) => Ok(b),
            other => Err(reply_error("exists", other)),
        }
    }

    /// `enumerate(id, count, offset, want_keys, want_vals, decr)`.
    pub fn enumerate(
        &mut self,
        id: u64,
        count: i64,
        offset: i64,
        want_keys: bool,
        want_vals: bool,
        decr: RefDelta,
    ) -> Result<Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::Enumerate { id, count, offset, want_keys, want_vals, decr })? {
            ClientReply::Entries(e) => Ok(e),
            other => Err(reply_error("enumerate", other)),
        }
    }

    /// `insert_atomic(id, sub, refcounts)`.
    pub fn insert_atomic(&mut self, id: u64, sub: Subscript, refcounts: RefCounts) -> Result<InsertAtomicResult> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::InsertAtomic { id, sub, refcounts })? {
            ClientReply::InsertAtomic { created, present, value } => Ok(InsertAtomicResult { created, present, value }),
            other => Err(reply_error("insert_atomic", other)),
        }
    }

    /// `subscribe(id, sub?, rank, work_type)`; the caller's own rank is
    /// always the one registered.
    pub fn subscribe(&mut self, id: u64, sub: Option<Subscript>, work_type: i32) -> Result<bool> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::Subscribe { id, sub, work_type })? {
            ClientReply::Bool(b) => Ok(b),
            other => Err(reply_error("subscribe", other)),
        }
    }

    /// `container_reference(id, sub, ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr)`.
    #[allow(clippy::too_many_arguments)]
    pub fn container_reference(
        &mut self,
        id: u64,
        sub: Subscript,
        ref_id: u64,
        ref_sub: Subscript,
        ref_type: DatumType,
        transfer_refs: RefCounts,
        ref_write_decr: i64,
    ) -> Result<()> {
        let server = self.layout.locate(id);
        self.call_ack(
            "container_reference",
            server,
            ClientOp::ContainerReference { id, sub, ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr },
        )
    }

    /// `refcount_incr(id, delta)`.
    pub fn refcount_incr(&mut self, id: u64, delta: RefDelta) -> Result<()> {
        let server = self.layout.locate(id);
        self.call_ack("refcount_incr", server, ClientOp::RefcountIncr { id, delta })
    }

    /// `refcount_get(id, decr) -> (read, write)`.
    pub fn refcount_get(&mut self, id: u64, decr: RefDelta) -> Result<(i64, i64)> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::RefcountGet { id, decr })? {
            ClientReply::Refcounts(r, w) => Ok((r, w)),
            other => Err(reply_error("refcount_get", other)),
        }
    }

    /// `read_refcount_enable()`: turn on read-refcount tracking job-wide.
    /// The enable flag lives per-server (spec §4.4 rule 1), so this
    /// broadcasts to every server rather than just this worker's home
    /// server.
    pub fn read_refcount_enable(&mut self) -> Result<()> {
        for server in self.layout.first_server()..self.layout.first_server() + self.layout.servers() {
            self.call_ack("read_refcount_enable", server, ClientOp::ReadRefcountEnable)?;
        }
        Ok(())
    }

    /// `permanent(id)`: exempt `id` from garbage collection.
    pub fn permanent(&mut self, id: u64) -> Result<()> {
        let server = self.layout.locate(id);
        self.call_ack("permanent", server, ClientOp::Permanent { id })
    }

    /// `lock(id, rank)`.
    pub fn lock(&mut self, id: u64) -> Result<bool> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::Lock { id })? {
            ClientReply::Bool(b) => Ok(b),
            other => Err(reply_error("lock", other)),
        }
    }

    /// `unlock(id)`.
    pub fn unlock(&mut self, id: u64) -> Result<()> {
        let server = self.layout.locate(id);
        self.call_ack("unlock", server, ClientOp::Unlock { id })
    }

    /// `unique() -> id`.
    pub fn unique(&mut self) -> Result<u64> {
        let server = self.home_server();
        match self.call(server, ClientOp::Unique)? {
            ClientReply::Id(i) => Ok(i),
            other => Err(reply_error("unique", other)),
        }
    }

    /// `alloc_global(count) -> first_id`.
    pub fn alloc_global(&mut self, count: u64) -> Result<u64> {
        let server = self.home_server();
        match self.call(server, ClientOp::AllocGlobal { count })? {
            ClientReply::Id(i) => Ok(i),
            other => Err(reply_error("alloc_global", other)),
        }
    }

    /// `typeof(id)`.
    pub fn typeof_(&mut self, id: u64) -> Result<DatumType> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::TypeOf { id })? {
            ClientReply::DatumType(t) => Ok(t),
            other => Err(reply_error("typeof", other)),
        }
    }

    /// `container_typeof(id)`.
    pub fn container_typeof(&mut self, id: u64) -> Result<DatumType> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::ContainerTypeOf { id })? {
            ClientReply::DatumType(t) => Ok(t),
            other => Err(reply_error("container_typeof", other)),
        }
    }

    /// `container_size(id)`.
    pub fn container_size(&mut self, id: u64) -> Result<usize> {
        let server = self.layout.locate(id);
        match self.call(server, ClientOp::ContainerSize { id })? {
            ClientReply::Size(s) => Ok(s),
            other => Err(reply_error("container_size", other)),
        }
    }

    /// `finalize()`: block until this worker's shutdown notice arrives.
    pub fn finalize(&mut self) -> Result<()> {
        loop {
            if self.transport.try_recv(Some(Tag::Response(crate::messaging::RequestKind::Shutdown))).is_some() {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    /// `fail(code)`: notify the home server of an unrecoverable application
    /// error, driving the whole job into emergency shutdown.
    pub fn fail(&mut self, code: i32) -> Result<()> {
        let server = self.home_server();
        self.call_ack("fail", server, ClientOp::Fail { code })
    }

    /// `abort(code)`: synonym for `fail`, kept distinct at the call site to
    /// mirror the upstream API's naming (spec §6.1).
    pub fn abort(&mut self, code: i32) -> Result<()> {
        self.fail(code)
    }
}

/// Strictness/accuracy-qualified helper matching spec §6.1's `opts` record;
/// convenience for building a `Target::Rank` without naming the enum path.
pub fn targeted(rank: Rank, strictness: Strictness, accuracy: Accuracy) -> Target {
    Target::Rank(rank, strictness, accuracy)
}
