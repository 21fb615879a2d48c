//! In-memory `Transport` test double standing in for MPI.
//!
//! A real MPI binding is an external adapter (spec §1 Out of scope); this
//! crate is transport-agnostic behind `messaging::Transport`. `ChannelTransport`
//! wires a mesh of `crossbeam::channel` queues so unit and integration tests
//! can exercise the sync protocol and server loop without a real cluster.

use crate::layout::Rank;
use crate::messaging::{Message, MessageHeader, Tag, Transport};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A fully-connected mesh of channel-backed endpoints, one per rank.
#[derive(Clone)]
pub struct ChannelMesh {
    inboxes: Arc<HashMap<Rank, Sender<Message>>>,
}

impl ChannelMesh {
    /// Build a mesh spanning `ranks`, returning one `ChannelTransport` per
    /// rank plus the mesh handle (kept alive for the test's duration).
    pub fn new(ranks: &[Rank]) -> (Self, Vec<ChannelTransport>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for &r in ranks {
            let (tx, rx) = unbounded();
            senders.insert(r, tx);
            receivers.insert(r, rx);
        }
        let mesh = ChannelMesh {
            inboxes: Arc::new(senders),
        };
        let transports = ranks
            .iter()
            .map(|&r| ChannelTransport {
                rank: r,
                mesh: mesh.clone(),
                inbox: receivers.remove(&r).expect("inbox for rank"),
                backlog: Arc::new(Mutex::new(Vec::new())),
            })
            .collect();
        (mesh, transports)
    }
}

/// Per-rank transport handle backed by an in-memory channel mesh.
pub struct ChannelTransport {
    rank: Rank,
    mesh: ChannelMesh,
    inbox: Receiver<Message>,
    /// Messages pulled off the channel but not matching the caller's tag
    /// filter are held here so later `try_recv` calls can still see them
    /// (a channel only yields a message to one receiver).
    backlog: Arc<Mutex<Vec<Message>>>,
}

impl Transport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&self, dst: Rank, header: MessageHeader, big_payload: Option<Vec<u8>>) -> crate::Result<()> {
        let inbox = self
            .mesh
            .inboxes
            .get(&dst)
            .ok_or_else(|| crate::AdlbError::NotFound(format!("no transport for rank {dst}")))?;
        inbox
            .send(Message { header, big_payload })
            .map_err(|_| crate::AdlbError::Unknown("peer channel closed".to_string()))
    }

    fn try_recv(&self, tag_filter: Option<Tag>) -> Option<Message> {
        {
            let mut backlog = self.backlog.lock().unwrap();
            if let Some(pos) = backlog
                .iter()
                .position(|m| tag_filter.map_or(true, |t| m.header.tag == t))
            {
                return Some(backlog.remove(pos));
            }
        }
        while let Ok(msg) = self.inbox.try_recv() {
            match tag_filter {
                Some(t) if msg.header.tag != t => {
                    self.backlog.lock().unwrap().push(msg);
                }
                _ => return Some(msg),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::RequestKind;

    #[test]
    fn send_and_receive_roundtrip() {
        let (_mesh, mut transports) = ChannelMesh::new(&[0, 1]);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();

        let (header, big) = MessageHeader::new(0, 1, Tag::Request(RequestKind::Get), b"hi");
        t0.send(1, header, big).unwrap();

        let msg = t1.try_recv(None).expect("message should arrive");
        assert_eq!(msg.header.src, 0);
        assert_eq!(msg.header.inline, b"hi".to_vec());
    }

    #[test]
    fn tag_filter_preserves_unmatched_in_backlog() {
        let (_mesh, mut transports) = ChannelMesh::new(&[0, 1]);
        let t1 = transports.pop().unwrap();
        let t0 = transports.pop().unwrap();

        let (h1, _) = MessageHeader::new(0, 1, Tag::Sync, b"a");
        let (h2, _) = MessageHeader::new(0, 1, Tag::Request(RequestKind::Get), b"b");
        t0.send(1, h1, None).unwrap();
        t0.send(1, h2, None).unwrap();

        let got = t1
            .try_recv(Some(Tag::Request(RequestKind::Get)))
            .expect("get message should be found past the sync one");
        assert_eq!(got.header.tag, Tag::Request(RequestKind::Get));

        let got2 = t1.try_recv(Some(Tag::Sync)).expect("sync message still queued");
        assert_eq!(got2.header.tag, Tag::Sync);
    }
}
