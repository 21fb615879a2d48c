//! The sole inter-server handshake primitive (spec §4.3)
//!
//! Every server-to-server interaction — task migration, refcount updates,
//! subscribe/notify, steal, shutdown — funnels through `SyncEngine`. The
//! danger this exists to avoid: two servers each blocked waiting on the
//! other's handler. The fix is a strict partial order: while waiting on
//! our own outgoing sync, accept any incoming sync from a *lower*-ranked
//! peer immediately, and defer any from a *higher*-ranked peer to be
//! served once we're done waiting. This breaks all cycles.

use crate::data::{RefCounts, RefDelta, Subscript};
use crate::error::{AdlbError, Result};
use crate::layout::Rank;
use crate::messaging::{MessageHeader, Tag, Transport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Sync handshake modes (spec §4.3). Most carry their payload inline;
/// `Subscribe` can overflow into a `Tag::SyncSub` follow-up message when
/// the subscript exceeds what fits in `PACKED_SYNC_SIZE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Generic rendezvous; always requires an accept.
    Request,
    /// Phase 1 of steal: "do you have spare work?"
    StealProbe,
    /// Reply to `StealProbe`, carrying per-type work counts.
    StealProbeResp {
        /// (work_type, count) pairs.
        counts: Vec<(i32, u32)>,
    },
    /// Phase 2 of steal: "send me your excess", carrying the initiator's
    /// own counts and an idle-check serial for invalidation tracking.
    Steal {
        /// (work_type, count) pairs, the initiator's own counts.
        counts: Vec<(i32, u32)>,
        /// Idle-check attempt serial in flight, if any (spec §4.10).
        idle_check_serial: Option<u64>,
    },
    /// Apply a refcount delta to a datum homed here. Fire-and-forget.
    Refcount {
        /// Target datum id.
        id: u64,
        /// Delta to apply.
        delta: RefDelta,
    },
    /// Like `Refcount` but the caller wants to know the accepted count was
    /// applied before proceeding (still fire-and-forget on the wire; the
    /// distinction is in how the caller's deferred-sync queue retires it).
    RefcountWait {
        /// Target datum id.
        id: u64,
        /// Delta to apply.
        delta: RefDelta,
    },
    /// Forward a subscribe request to a datum's home server.
    Subscribe {
        /// Target datum id.
        id: u64,
        /// Subscript, if any.
        sub: Option<Subscript>,
        /// Rank to notify.
        rank: Rank,
        /// Work type for the notify task.
        work_type: i32,
    },
    /// Tell a subscriber that a previously subscribed datum/subscript
    /// fired.
    Notify {
        /// Datum id that fired.
        id: u64,
        /// Subscript, if any.
        sub: Option<Subscript>,
    },
    /// Deliver a notify event as a work unit to a worker homed on another
    /// server (spec §4.5: notify messages are shipped as priority-1 work).
    DeliverNotify {
        /// Subscriber worker rank.
        rank: Rank,
        /// Work type to dispatch the notify task as.
        work_type: i32,
        /// Canonical `close <id> [<sub>]` payload.
        payload: Vec<u8>,
    },
    /// Global shutdown announcement from the master server.
    Shutdown,
    /// Master → peer: idle-check round query carrying the round's serial.
    IdleQuery {
        /// This round's idle-check attempt serial (spec §4.10).
        serial: u64,
    },
    /// Peer → master: the reply to `IdleQuery`.
    IdleReport {
        /// The serial this report answers.
        serial: u64,
        /// Whether the peer is itself locally idle.
        idle: bool,
        /// Peer's per-type live work-queue counts.
        work_counts: Vec<(i32, u32)>,
        /// Peer's per-type outstanding request counts.
        request_counts: Vec<(i32, u32)>,
    },
}

impl SyncMode {
    /// Whether this mode is a one-shot fire-and-forget (no accept token)
    /// or a rendezvous that blocks the initiator until accepted.
    pub fn requires_accept(&self) -> bool {
        matches!(
            self,
            SyncMode::Request | SyncMode::Steal { .. } | SyncMode::StealProbe | SyncMode::IdleQuery { .. }
        )
    }
}

/// The fixed-size header carried by a sync message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHeader {
    /// Sending server rank.
    pub src: Rank,
    /// Destination server rank.
    pub dst: Rank,
    /// The handshake mode and its inline payload.
    pub mode: SyncMode,
}

/// Free-function form of `SyncEngine::send_oneshot`, taking `src`
/// explicitly instead of borrowing a `SyncEngine`. Lets callers (notably
/// `ServerContext`'s sync-effect handler) send a fire-and-forget sync
/// while a `SyncEngine` rendezvous elsewhere is already borrowed.
pub fn send_oneshot_from(src: Rank, transport: &impl Transport, dst: Rank, mode: SyncMode) -> Result<()> {
    debug_assert!(!mode.requires_accept());
    let header = SyncHeader { src, dst, mode };
    let bytes = bincode::serialize(&header)?;
    if bytes.len() > crate::messaging::PACKED_SYNC_SIZE {
        let (msg_header, big) = MessageHeader::new(src, dst, Tag::SyncSub, &bytes);
        return transport.send(dst, msg_header, big);
    }
    let (msg_header, big) = MessageHeader::new(src, dst, Tag::Sync, &bytes);
    transport.send(dst, msg_header, big)
}

/// What a deferred unit is waiting on (spec §4.3 "Deferred handling
/// queue").
#[derive(Debug, Clone)]
pub enum DeferredKind {
    /// A sync accepted from a peer but not yet serviced.
    DeferredSync,
    /// A refcount sync accepted but not yet applied.
    AcceptedRefcount,
    /// A notify accepted but not yet delivered to the local engine.
    DeferredNotify,
    /// An outgoing notify we owe back to the requester.
    UnsentNotify,
    /// A steal probe/response accepted but not yet serviced.
    DeferredSteal,
}

/// A pending unit in the deferred queue.
#[derive(Debug, Clone)]
pub struct DeferredUnit {
    /// What this unit is waiting on.
    pub kind: DeferredKind,
    /// The peer rank this unit concerns.
    pub rank: Rank,
    /// The original header.
    pub header: SyncHeader,
}

/// A FIFO ring of deferred sync units that resizes geometrically and
/// halves when occupancy drops below a quarter (spec §4.3).
pub struct DeferredQueue {
    items: VecDeque<DeferredUnit>,
    min_capacity: usize,
}

impl DeferredQueue {
    /// A new queue with the given initial capacity
    /// (`ADLB_DEBUG_SYNC_BUFFER_SIZE`).
    pub fn new(initial_capacity: usize) -> Self {
        DeferredQueue {
            items: VecDeque::with_capacity(initial_capacity.max(1)),
            min_capacity: initial_capacity.max(1),
        }
    }

    /// Enqueue a unit, growing geometrically if at capacity (the default
    /// `VecDeque` growth policy already doubles; this simply documents
    /// that choice at the call site).
    pub fn push(&mut self, unit: DeferredUnit) {
        self.items.push_back(unit);
    }

    /// Pop the oldest unit, shrinking the backing allocation once
    /// occupancy drops below a quarter of capacity.
    pub fn pop(&mut self) -> Option<DeferredUnit> {
        let unit = self.items.pop_front();
        let cap = self.items.capacity();
        if cap > self.min_capacity && self.items.len() < cap / 4 {
            self.items.shrink_to(cap / 2);
        }
        unit
    }

    /// Number of units currently deferred.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of `SyncEngine::poll_incoming`: either a lower-rank sync was
/// serviced immediately, a higher-rank sync was deferred, or nothing
/// arrived.
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing to do.
    Idle,
    /// A sync from a lower (or equal, self-originated loopback never
    /// happens) rank was accepted and handled inline.
    Serviced {
        /// The peer that sent it.
        from: Rank,
    },
    /// A sync from a higher rank was pushed to the deferred queue.
    Deferred {
        /// The peer that sent it.
        from: Rank,
    },
}

/// Drives the sync handshake over a `Transport`. Holds no server-loop
/// state itself — `ServerContext` supplies a handler closure that applies
/// the effect of each accepted sync (spec Design Notes §9: explicit state
/// machine, not a blocking call).
pub struct SyncEngine {
    rank: Rank,
    deferred: DeferredQueue,
    /// True once this engine has observed a `Shutdown` sync and should
    /// cancel any sync it is waiting on (spec §4.3 last bullet).
    shutdown_seen: bool,
}

impl SyncEngine {
    /// A new engine for `rank`, with the deferred queue sized per
    /// `ADLB_DEBUG_SYNC_BUFFER_SIZE`.
    pub fn new(rank: Rank, deferred_initial_capacity: usize) -> Self {
        SyncEngine {
            rank,
            deferred: DeferredQueue::new(deferred_initial_capacity),
            shutdown_seen: false,
        }
    }

    /// Whether a shutdown sync has been observed; the server loop checks
    /// this to stop issuing new syncs.
    pub fn shutdown_seen(&self) -> bool {
        self.shutdown_seen
    }

    /// Send a fire-and-forget sync (no accept token expected).
    pub fn send_oneshot(&self, transport: &impl Transport, dst: Rank, mode: SyncMode) -> Result<()> {
        send_oneshot_from(self.rank, transport, dst, mode)
    }

    /// Perform a rendezvous sync requiring an accept: send the header,
    /// then poll for the accept token while servicing any incoming syncs
    /// via `handler` per the tie-break rule (spec §4.3). Returns the
    /// accept payload, or `None` if cancelled by a racing shutdown.
    pub fn do_sync(
        &mut self,
        transport: &impl Transport,
        dst: Rank,
        mode: SyncMode,
        mut handler: impl FnMut(Rank, SyncMode) -> Option<SyncMode>,
    ) -> Result<Option<SyncMode>> {
        debug_assert!(mode.requires_accept());
        let header = SyncHeader { src: self.rank, dst, mode };
        let bytes = bincode::serialize(&header)?;
        let (msg_header, big) = MessageHeader::new(self.rank, dst, Tag::Sync, &bytes);
        transport.send(dst, msg_header, big)?;
        trace!(to = dst, "sync sent, awaiting accept");

        loop {
            if self.shutdown_seen {
                // Cancellation: unblock the peer with a dummy WORK message
                // so it is never left waiting on us (spec §5 Cancellation).
                warn!(to = dst, "sync cancelled by racing shutdown");
                let (dummy_header, dummy_big) =
                    MessageHeader::new(self.rank, dst, Tag::Request(crate::messaging::RequestKind::Get), b"");
                let _ = transport.send(dst, dummy_header, dummy_big);
                return Ok(None);
            }

            if let Some(msg) = transport.try_recv(Some(Tag::Sync)) {
                let incoming: SyncHeader = bincode::deserialize(&msg.header.inline)?;
                if matches!(incoming.mode, SyncMode::Shutdown) {
                    self.shutdown_seen = true;
                    continue;
                }
                if incoming.src < self.rank {
                    // Lower rank: must accept and serve immediately.
                    self.service(transport, incoming, &mut handler)?;
                } else {
                    // Higher rank: defer to avoid re-entrant deadlock.
                    debug!(from = incoming.src, "deferring sync from higher-ranked peer");
                    self.deferred.push(DeferredUnit {
                        kind: DeferredKind::DeferredSync,
                        rank: incoming.src,
                        header: incoming,
                    });
                }
                continue;
            }

            // Poll for our own accept, addressed back on the same tag.
            if let Some(msg) = transport.try_recv(Some(Tag::SyncAccept)) {
                let accept: SyncHeader = bincode::deserialize(&msg.header.inline)?;
                return Ok(Some(accept.mode));
            }

            std::thread::yield_now();
        }
    }

    fn service(
        &mut self,
        transport: &impl Transport,
        incoming: SyncHeader,
        handler: &mut impl FnMut(Rank, SyncMode) -> Option<SyncMode>,
    ) -> Result<()> {
        let from = incoming.src;
        let needs_accept = incoming.mode.requires_accept();
        let reply = handler(from, incoming.mode);
        if needs_accept {
            if let Some(reply_mode) = reply {
                let reply_header = SyncHeader { src: self.rank, dst: from, mode: reply_mode };
                let bytes = bincode::serialize(&reply_header)?;
                let (msg_header, big) =
                    MessageHeader::new(self.rank, from, Tag::SyncAccept, &bytes);
                transport.send(from, msg_header, big)?;
            }
        }
        Ok(())
    }

    /// Drain one incoming sync not tied to an in-progress `do_sync`,
    /// servicing it via `handler`. Called from the server loop's main
    /// poll step (spec §4.10 step 2).
    pub fn poll_incoming(
        &mut self,
        transport: &impl Transport,
        mut handler: impl FnMut(Rank, SyncMode) -> Option<SyncMode>,
    ) -> Result<PollOutcome> {
        let Some(msg) = transport.try_recv(Some(Tag::Sync)) else {
            return Ok(PollOutcome::Idle);
        };
        let incoming: SyncHeader = bincode::deserialize(&msg.header.inline)?;
        if matches!(incoming.mode, SyncMode::Shutdown) {
            self.shutdown_seen = true;
            return Ok(PollOutcome::Serviced { from: incoming.src });
        }
        let from = incoming.src;
        self.service(transport, incoming, &mut handler)?;
        Ok(PollOutcome::Serviced { from })
    }

    /// Drain one unit from the deferred queue, if any, servicing it via
    /// `handler` (spec §4.10 step 3).
    pub fn drain_deferred(
        &mut self,
        transport: &impl Transport,
        handler: &mut impl FnMut(Rank, SyncMode) -> Option<SyncMode>,
    ) -> Result<bool> {
        let Some(unit) = self.deferred.pop() else {
            return Ok(false);
        };
        self.service(transport, unit.header, handler)?;
        Ok(true)
    }

    /// Number of units currently deferred (for tests/metrics).
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelMesh;

    #[test]
    fn lower_rank_sync_is_serviced_inline_while_waiting() {
        let (_mesh, mut transports) = ChannelMesh::new(&[0, 1]);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();

        let mut engine0 = SyncEngine::new(0, 8);
        let mut engine1 = SyncEngine::new(1, 8);

        // Rank 1 sends a fire-and-forget refcount sync to rank 0.
        engine1
            .send_oneshot(&t1, 0, SyncMode::Refcount { id: 7, delta: RefDelta { read: 0, write: -1 } })
            .unwrap();

        let outcome = engine0
            .poll_incoming(&t0, |from, mode| {
                assert_eq!(from, 1);
                assert!(matches!(mode, SyncMode::Refcount { .. }));
                None
            })
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Serviced { from: 1 }));
    }

    #[test]
    fn deferred_queue_shrinks_below_quarter_occupancy() {
        let mut dq = DeferredQueue::new(4);
        for i in 0..16 {
            dq.push(DeferredUnit {
                kind: DeferredKind::DeferredSync,
                rank: i,
                header: SyncHeader { src: i, dst: 0, mode: SyncMode::Shutdown },
            });
        }
        let cap_before = dq.items.capacity();
        for _ in 0..15 {
            dq.pop();
        }
        assert!(dq.items.capacity() <= cap_before);
    }
}
