//! Notification engine (spec §4.5)
//!
//! A single store/refcount operation produces a `NotifSet`; draining it to
//! a fixpoint applies preacquire refcounts, then references (which may
//! recursively produce more of all three queues), then the remaining
//! refcount changes, then sends notify messages — repeating until all
//! three queues are empty.

use crate::data::{DataStore, NotifSet, RefDelta};
use crate::error::Result;
use crate::layout::Rank;

/// True iff every one of the three queues in `notif` is empty.
///
/// The upstream C source (`xlb_notif_empty`) requires `references.count
/// != 0` alongside the other two being empty — almost certainly a bug
/// (spec Design Notes §9). This core implements the evidently-intended
/// semantics instead: empty iff notify, references, and refc_changes are
/// *all* empty.
pub fn is_empty(notif: &NotifSet) -> bool {
    notif.notify.is_empty() && notif.references.is_empty() && notif.refc_changes.is_empty()
}

/// An outbound notify message produced by draining a `NotifSet`, ready to
/// be shipped as a priority-1 work unit carrying a canonical
/// `close <id> [<sub>]` payload (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundNotify {
    /// Destination rank.
    pub rank: Rank,
    /// Work type to dispatch the notify task as.
    pub work_type: i32,
    /// Canonical payload, e.g. `"close 10 foo"` or `"close 1"`.
    pub payload: String,
}

/// Drain `notif` to a fixpoint against `store`, applying preacquire
/// refcounts first, then references, then remaining refcount changes,
/// then collecting notify messages — iterating because references and
/// refcount changes can themselves produce more of all three queues.
///
/// Returns the accumulated outbound notify messages in drain order.
pub fn drain(store: &mut DataStore, mut notif: NotifSet) -> Result<Vec<OutboundNotify>> {
    let mut outbound = Vec::new();

    while !is_empty(&notif) {
        let mut next = NotifSet::default();

        // 1. Preacquire-required refcount increments first.
        let (preacquire, rest): (Vec<_>, Vec<_>) =
            notif.refc_changes.into_iter().partition(|(_, _, must_preacquire)| *must_preacquire);
        for (id, delta, _) in preacquire {
            next.extend_sub(store.refcount_incr(id, delta)?);
        }

        // 2. Set references (recursive: each is a Store).
        for (ref_id, ref_sub, ref_type, bytes, transfer_refs, ref_write_decr) in notif.references {
            let store_refs = crate::data::RefCounts { read: transfer_refs.read, write: transfer_refs.write };
            let sub_notif = store.store(
                ref_id,
                if ref_sub.is_empty() { None } else { Some(&ref_sub) },
                ref_type,
                &bytes,
                RefDelta::NONE,
                store_refs,
            )?;
            next.extend_sub(sub_notif);
            if ref_write_decr != 0 {
                next.extend_sub(store.refcount_incr(ref_id, RefDelta { read: 0, write: -ref_write_decr })?);
            }
        }

        // 3. Remaining refcount changes.
        for (id, delta, _) in rest {
            next.extend_sub(store.refcount_incr(id, delta)?);
        }

        // 4. Send notify messages.
        for (rank, id, sub, work_type) in notif.notify {
            let payload = if sub.is_empty() {
                format!("close {id}")
            } else {
                format!("close {id} {}", String::from_utf8_lossy(&sub))
            };
            outbound.push(OutboundNotify { rank, work_type, payload });
        }

        notif = next;
    }

    Ok(outbound)
}

/// Extension used only within this module to fold a sub-operation's
/// `NotifSet` into the one being drained.
trait ExtendSub {
    fn extend_sub(&mut self, other: NotifSet);
}

impl ExtendSub for NotifSet {
    fn extend_sub(&mut self, other: NotifSet) {
        self.notify.extend(other.notify);
        self.references.extend(other.references);
        self.refc_changes.extend(other.refc_changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CreateProps, DatumType, RefCounts};

    #[test]
    fn empty_requires_all_three_queues_empty() {
        let mut notif = NotifSet::default();
        assert!(is_empty(&notif));
        notif.references.push((1, Vec::new(), DatumType::Integer, vec![], RefCounts::default(), 0));
        assert!(!is_empty(&notif));
    }

    #[test]
    fn producer_consumer_e1_end_to_end() {
        let mut store = DataStore::new(0, 1);
        let id = store.create(Some(1), DatumType::Integer, CreateProps::default_counts()).unwrap();
        store.subscribe(id, None, 1, 0).unwrap();
        let notif = store
            .store(id, None, DatumType::Integer, b"42", crate::data::RefDelta::NONE, RefCounts::default())
            .unwrap();
        let outbound = drain(&mut store, notif).unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].rank, 1);
        assert_eq!(outbound[0].work_type, 0);
        assert_eq!(outbound[0].payload, "close 1");
    }
}
