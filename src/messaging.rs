//! Typed message tags, fixed headers, and the transport abstraction
//! (spec §4.2, §6.2)

use crate::layout::Rank;
use serde::{Deserialize, Serialize};

/// Upper bound, in bytes, on any server-to-server sync message so that a
/// receiver can post fixed-size receive buffers (spec §4.2).
pub const PACKED_SYNC_SIZE: usize = 512;

/// Payloads at or below this size are inlined into a message header
/// instead of being chunked as a separate big-send.
pub const BIG_MESSAGE_THRESHOLD: usize = 4096;

/// Message tag groups (spec §6.2): request-to-server, response-to-worker,
/// server-to-server sync, and payload transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Worker → server: Get/Put/Store/... requests.
    Request(RequestKind),
    /// Server → worker: responses to requests above.
    Response(RequestKind),
    /// Worker → server: the full client RPC surface (see `client.rs`),
    /// carrying a `ClientOp` rather than a single fixed `RequestKind` so
    /// one tag covers the whole Get/Put/Store/... surface.
    ClientRequest,
    /// Server → worker: the reply to `ClientRequest`, carrying a
    /// `ClientReply`. A blocking `Get` may answer this tag long after the
    /// request arrived, once matching work shows up.
    ClientResponse,
    /// Server → server: the sole sync handshake (see `sync.rs`).
    Sync,
    /// Server → server: the accept token for a rendezvous sync.
    SyncAccept,
    /// Server → server: sync payload too large to inline (`SYNC_SUB`).
    SyncSub,
    /// Either direction: a big-send payload chunk following a header.
    Payload,
}

/// The operation a request/response tag pair carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Blocking or non-blocking work fetch.
    Get,
    /// Enqueue an independent task.
    Put,
    /// Enqueue a data-dependent task.
    DPut,
    /// Scalar/subscript store.
    Store,
    /// Scalar/subscript retrieve.
    Retrieve,
    /// Existence probe.
    Exists,
    /// Container/multiset enumeration.
    Enumerate,
    /// Reserve-if-absent primitive.
    InsertAtomic,
    /// Register a notify listener.
    Subscribe,
    /// Register a reference-set listener.
    ContainerReference,
    /// Adjust read/write refcounts.
    RefcountIncr,
    /// Query current refcounts.
    RefcountGet,
    /// Advisory lock/unlock.
    Lock,
    /// Advisory lock/unlock.
    Unlock,
    /// Create a new datum.
    Create,
    /// Shutdown notice to a worker.
    Shutdown,
}

/// Fixed-width header carried by every message. `inline` holds small
/// mode-specific payload (e.g. a `SyncHeader`'s encoded bytes); payloads
/// larger than `BIG_MESSAGE_THRESHOLD` are sent as a separate `Tag::Payload`
/// message referenced by `big_len`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sending rank.
    pub src: Rank,
    /// Destination rank.
    pub dst: Rank,
    /// Message tag.
    pub tag: Tag,
    /// Length of an out-of-line payload, if any (0 = none, fully inline).
    pub big_len: u32,
    /// Inlined payload bytes (small messages, or mode-specific fixed data).
    pub inline: Vec<u8>,
}

impl MessageHeader {
    /// Construct a header, choosing big-send chunking automatically based
    /// on `payload`'s length relative to `BIG_MESSAGE_THRESHOLD`.
    pub fn new(src: Rank, dst: Rank, tag: Tag, payload: &[u8]) -> (Self, Option<Vec<u8>>) {
        if payload.len() <= BIG_MESSAGE_THRESHOLD {
            (
                MessageHeader {
                    src,
                    dst,
                    tag,
                    big_len: 0,
                    inline: payload.to_vec(),
                },
                None,
            )
        } else {
            (
                MessageHeader {
                    src,
                    dst,
                    tag,
                    big_len: payload.len() as u32,
                    inline: Vec::new(),
                },
                Some(payload.to_vec()),
            )
        }
    }

    /// True if this header carries an out-of-line payload chunk.
    pub fn is_big(&self) -> bool {
        self.big_len > 0
    }
}

/// A fully assembled wire message: `(src, dst, tag, bytes)` per spec §6.2.
#[derive(Debug, Clone)]
pub struct Message {
    /// Header (always present).
    pub header: MessageHeader,
    /// Out-of-line payload bytes, present iff `header.is_big()`.
    pub big_payload: Option<Vec<u8>>,
}

/// Transport abstraction the sync protocol and server loop poll.
///
/// The real runtime sits on MPI (out of scope for this core, spec §1);
/// `ChannelTransport` (see `transport.rs`) is the in-memory test double
/// used by integration tests in place of a real cluster.
pub trait Transport {
    /// This rank.
    fn rank(&self) -> Rank;

    /// Non-blocking send. Ordered per (src, dst, tag) as MPI guarantees
    /// (spec §5 Ordering).
    fn send(&self, dst: Rank, header: MessageHeader, big_payload: Option<Vec<u8>>) -> crate::Result<()>;

    /// Non-blocking receive attempt for the given tag class from `src`
    /// (`None` = any source). Returns `None` if nothing is pending.
    fn try_recv(&self, tag_filter: Option<Tag>) -> Option<Message>;
}
