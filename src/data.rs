//! The distributed single-assignment data store (spec §3.1, §3.2, §4.4)
//!
//! Each server owns a disjoint partition of the datum-id space; a
//! `DataStore` holds exactly the datums homed on one server. Subscripts
//! address into compound payloads; listeners fire once, on the subscript
//! whose assignment they are a byte-string prefix of.

use crate::error::{AdlbError, Result};
use crate::layout::Rank;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum subscript length in bytes (spec §3.1).
pub const MAX_SUBSCRIPT_LEN: usize = 1024;

/// A subscript is an opaque byte string addressing into a compound datum.
pub type Subscript = Vec<u8>;

/// The type tag carried by a datum or a compound slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatumType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
    /// Opaque byte blob.
    Blob,
    /// Reference (datum id).
    Reference,
    /// Mapping from variable-length key bytes to a value slot.
    Container,
    /// Append-only bag of typed values.
    Multiset,
    /// Fixed, type-described sequence of fields.
    Struct,
}

/// A scalar value, the leaf of any datum or compound slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Integer payload.
    Integer(i64),
    /// Float payload.
    Float(f64),
    /// String payload.
    Str(String),
    /// Blob payload.
    Blob(Vec<u8>),
    /// Reference to another datum's id.
    Reference(u64),
}

impl Value {
    /// The type tag of this value.
    pub fn dtype(&self) -> DatumType {
        match self {
            Value::Integer(_) => DatumType::Integer,
            Value::Float(_) => DatumType::Float,
            Value::Str(_) => DatumType::String,
            Value::Blob(_) => DatumType::Blob,
            Value::Reference(_) => DatumType::Reference,
        }
    }

    /// Decode a typed scalar from wire bytes.
    pub fn decode(dtype: DatumType, bytes: &[u8]) -> Result<Self> {
        match dtype {
            DatumType::Integer => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| AdlbError::NumberFormat(e.to_string()))?;
                s.parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|e| AdlbError::NumberFormat(e.to_string()))
            }
            DatumType::Float => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| AdlbError::NumberFormat(e.to_string()))?;
                s.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| AdlbError::NumberFormat(e.to_string()))
            }
            DatumType::String => std::str::from_utf8(bytes)
                .map(|s| Value::Str(s.to_string()))
                .map_err(|e| AdlbError::Invalid(e.to_string())),
            DatumType::Blob => Ok(Value::Blob(bytes.to_vec())),
            DatumType::Reference => {
                if bytes.len() != 8 {
                    return Err(AdlbError::Invalid("reference payload must be 8 bytes".into()));
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                Ok(Value::Reference(u64::from_le_bytes(arr)))
            }
            other => Err(AdlbError::TypeMismatch(0, format!("{other:?} is not scalar"))),
        }
    }

    /// Encode this scalar to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Integer(i) => i.to_string().into_bytes(),
            Value::Float(f) => f.to_string().into_bytes(),
            Value::Str(s) => s.clone().into_bytes(),
            Value::Blob(b) => b.clone(),
            Value::Reference(id) => id.to_le_bytes().to_vec(),
        }
    }

    /// Reference id carried by this value, if it is a `Reference`.
    pub fn referand(&self) -> Option<u64> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

/// A reservation slot: either a placeholder with no value yet, or set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    /// Reserved but not yet assigned.
    Reserved,
    /// Assigned a scalar value.
    Scalar(Value),
    /// Assigned a nested compound value (struct field nesting only).
    Compound(Box<Payload>),
}

impl Slot {
    fn is_set(&self) -> bool {
        !matches!(self, Slot::Reserved)
    }
}

/// The variant payload of a datum or a nested compound slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// A not-yet-assigned scalar.
    ScalarUnset,
    /// An assigned scalar.
    Scalar(Value),
    /// `container[K,V]`: key bytes -> slot.
    Container(BTreeMap<Vec<u8>, Slot>),
    /// Append-only bag.
    Multiset(Vec<Value>),
    /// Fixed sequence of typed fields.
    Struct {
        /// Declared type of each field, fixed at creation.
        field_types: Vec<DatumType>,
        /// Per-field slot.
        fields: Vec<Slot>,
    },
}

impl Payload {
    fn new_unset(dtype: DatumType, field_types: Option<Vec<DatumType>>) -> Self {
        match dtype {
            DatumType::Container => Payload::Container(BTreeMap::new()),
            DatumType::Multiset => Payload::Multiset(Vec::new()),
            DatumType::Struct => {
                let field_types = field_types.unwrap_or_default();
                let n = field_types.len();
                Payload::Struct {
                    field_types,
                    fields: vec![Slot::Reserved; n],
                }
            }
            _ => Payload::ScalarUnset,
        }
    }
}

/// A listener attached to a datum at a subscript (empty = whole datum).
#[derive(Debug, Clone)]
pub enum Listener {
    /// Deliver a notify message to `rank` on close/assignment.
    Notify {
        /// Rank to notify.
        rank: Rank,
        /// Work type the notify task should be dispatched as.
        work_type: i32,
    },
    /// Set `ref_id[ref_sub]` once the watched subscript is assigned.
    Reference {
        /// Destination datum id.
        ref_id: u64,
        /// Destination subscript.
        ref_sub: Subscript,
        /// Declared type of the destination slot.
        ref_type: DatumType,
        /// Refcounts to transfer onto the destination reference.
        transfer_refs: RefCounts,
        /// Write-refcount decrement to apply to the source on fire.
        ref_write_decr: i64,
    },
}

/// Absolute refcount pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCounts {
    /// Read refcount.
    pub read: i64,
    /// Write refcount.
    pub write: i64,
}

/// A refcount delta to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDelta {
    /// Read delta.
    pub read: i64,
    /// Write delta.
    pub write: i64,
}

impl RefDelta {
    /// The zero delta (no-op).
    pub const NONE: RefDelta = RefDelta { read: 0, write: 0 };
}

/// A single datum: a single-assignment shared variable (spec §3.1).
#[derive(Debug, Clone)]
pub struct Datum {
    id: u64,
    dtype: DatumType,
    payload: Payload,
    permanent: bool,
    release_write_refs: bool,
    subscript_notifs: bool,
    read_refcount: i64,
    write_refcount: i64,
    listeners: Vec<(Subscript, Listener)>,
    /// Declared element type for a `Container`/`Multiset`, from
    /// `CreateProps::field_types[0]` (spec §6.1 `container_typeof`).
    /// Meaningless for other `dtype`s.
    element_type: DatumType,
}

impl Datum {
    fn closed(&self) -> bool {
        self.write_refcount <= 0
    }

    fn garbage(&self) -> bool {
        !self.permanent && self.read_refcount <= 0 && self.write_refcount <= 0
    }
}

/// Extra per-create properties (spec §4.4 `create`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateProps {
    /// Initial read refcount (default 1 per spec §3.2 invariant 2/3).
    pub read_refcount: i64,
    /// Initial write refcount (must start >= 1, spec §3.2 invariant 2).
    pub write_refcount: i64,
    /// Exempt from garbage collection.
    pub permanent: bool,
    /// Decrement referands' write counts when this datum closes.
    pub release_write_refs: bool,
    /// Declared field types, required when `dtype == Struct`.
    pub field_types: Option<Vec<DatumType>>,
}

impl CreateProps {
    /// The conventional default: `{read: 1, write: 1}`, matching most
    /// call sites in spec §8's end-to-end scenarios.
    pub fn default_counts() -> Self {
        CreateProps {
            read_refcount: 1,
            write_refcount: 1,
            permanent: false,
            release_write_refs: false,
            field_types: None,
        }
    }
}

/// Result of `insert_atomic`.
#[derive(Debug, Clone)]
pub struct InsertAtomicResult {
    /// True iff this call reserved the slot (at-most-one across callers).
    pub created: bool,
    /// True iff the slot was already assigned a value.
    pub present: bool,
    /// The existing value, if `present`.
    pub value: Option<Vec<u8>>,
}

/// The notification set produced by a single store/refcount operation
/// (spec §4.5). Draining it to a fixpoint is `notify::NotifSet::drain`.
#[derive(Debug, Clone, Default)]
pub struct NotifSet {
    /// (rank, id, subscript, work_type) notify tuples.
    pub notify: Vec<(Rank, u64, Subscript, i32)>,
    /// (ref_id, ref_sub, type, value bytes, transfer refs, write decr).
    pub references: Vec<(u64, Subscript, DatumType, Vec<u8>, RefCounts, i64)>,
    /// (id, delta, must_preacquire).
    pub refc_changes: Vec<(u64, RefDelta, bool)>,
}

impl NotifSet {
    fn extend(&mut self, other: NotifSet) {
        self.notify.extend(other.notify);
        self.references.extend(other.references);
        self.refc_changes.extend(other.refc_changes);
    }
}

/// Server-local collection of the datums homed here.
pub struct DataStore {
    rank: Rank,
    servers: i32,
    datums: BTreeMap<u64, Datum>,
    next_minted: u64,
    /// Advisory locks, out-of-band from refcounting.
    locks: BTreeMap<u64, Rank>,
    /// Global read-refcounting toggle (spec §4.4 rule 1); off until a
    /// worker calls `read_refcount_enable`, matching
    /// `xlb_s.read_refc_enabled`'s default-off behavior.
    read_refc_enabled: bool,
}

impl DataStore {
    /// An empty store for server `rank` among `servers` total servers.
    pub fn new(rank: Rank, servers: i32) -> Self {
        DataStore {
            rank,
            servers,
            datums: BTreeMap::new(),
            next_minted: rank as u64,
            locks: BTreeMap::new(),
            read_refc_enabled: false,
        }
    }

    /// `read_refcount_enable()`: turn on read-refcount tracking job-wide.
    /// Idempotent.
    pub fn enable_read_refcount(&mut self) {
        self.read_refc_enabled = true;
    }

    /// `permanent(id)`: exempt an existing datum from garbage collection.
    pub fn mark_permanent(&mut self, id: u64) -> Result<()> {
        self.get_mut(id)?.permanent = true;
        Ok(())
    }

    /// Mint a fresh id homed on this server (spec §6.1 `unique`).
    pub fn unique(&mut self) -> u64 {
        let id = self.next_minted;
        self.next_minted += self.servers as u64;
        id
    }

    /// Mint `count` contiguous ids homed on this server, returning the
    /// first (spec §6.1 `alloc_global`).
    pub fn alloc_global(&mut self, count: u64) -> u64 {
        let first = self.next_minted;
        self.next_minted += count * self.servers as u64;
        first
    }

    /// Create a new datum, minting an id if `id` is `None`.
    pub fn create(&mut self, id: Option<u64>, dtype: DatumType, props: CreateProps) -> Result<u64> {
        let id = id.unwrap_or_else(|| self.unique());
        if self.datums.contains_key(&id) {
            return Err(AdlbError::DoubleDeclare(id));
        }
        if props.write_refcount < 1 {
            return Err(AdlbError::Invalid("write refcount must start >= 1".into()));
        }
        if dtype == DatumType::Struct && props.field_types.is_none() {
            return Err(AdlbError::Invalid("struct create requires field_types".into()));
        }
        let element_type = props.field_types.as_ref().and_then(|v| v.first().copied()).unwrap_or(DatumType::Blob);
        let payload = Payload::new_unset(dtype, props.field_types);
        self.datums.insert(
            id,
            Datum {
                id,
                dtype,
                payload,
                permanent: props.permanent,
                release_write_refs: props.release_write_refs,
                subscript_notifs: false,
                read_refcount: props.read_refcount,
                write_refcount: props.write_refcount,
                listeners: Vec::new(),
                element_type,
            },
        );
        Ok(id)
    }

    /// The declared type of `id` (spec §6.1 `typeof`).
    pub fn typeof_datum(&self, id: u64) -> Result<DatumType> {
        Ok(self.get(id)?.dtype)
    }

    /// The declared element type of a `Container`/`Multiset` (spec §6.1
    /// `container_typeof`).
    pub fn container_val_type(&self, id: u64) -> Result<DatumType> {
        let datum = self.get(id)?;
        if !matches!(datum.dtype, DatumType::Container | DatumType::Multiset) {
            return Err(AdlbError::TypeMismatch(id, "not a container or multiset".into()));
        }
        Ok(datum.element_type)
    }

    /// Number of entries in a `Container`/`Multiset` (spec §6.1
    /// `container_size`).
    pub fn container_size(&self, id: u64) -> Result<usize> {
        match &self.get(id)?.payload {
            Payload::Container(map) => Ok(map.iter().filter(|(_, s)| s.is_set()).count()),
            Payload::Multiset(values) => Ok(values.len()),
            _ => Err(AdlbError::TypeMismatch(id, "not a container or multiset".into())),
        }
    }

    /// Produce up to `count` (or all, if negative) key/value pairs from a
    /// `Container`/`Multiset` starting at `offset`, applying `decr`
    /// atomically afterward (spec §4.4 `enumerate`). Multiset entries carry
    /// no key; `want_keys` is ignored for them.
    pub fn enumerate(
        &mut self,
        id: u64,
        count: i64,
        offset: i64,
        want_keys: bool,
        want_vals: bool,
        decr: RefDelta,
    ) -> Result<Vec<(Option<Vec<u8>>, Option<Vec<u8>>)>> {
        let offset = offset.max(0) as usize;
        let datum = self.get(id)?;
        let out = match &datum.payload {
            Payload::Container(map) => map
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Scalar(v) => Some((k.clone(), v.encode())),
                    _ => None,
                })
                .skip(offset)
                .take(if count < 0 { usize::MAX } else { count as usize })
                .map(|(k, v)| (want_keys.then_some(k), want_vals.then_some(v)))
                .collect(),
            Payload::Multiset(values) => values
                .iter()
                .skip(offset)
                .take(if count < 0 { usize::MAX } else { count as usize })
                .map(|v| (None, want_vals.then(|| v.encode())))
                .collect(),
            _ => return Err(AdlbError::TypeMismatch(id, "enumerate requires a container or multiset".into())),
        };
        if decr != RefDelta::NONE {
            self.refcount_incr(id, RefDelta { read: -decr.read, write: -decr.write })?;
        }
        Ok(out)
    }

    fn get(&self, id: u64) -> Result<&Datum> {
        self.datums
            .get(&id)
            .ok_or_else(|| AdlbError::NotFound(format!("datum {id}")))
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut Datum> {
        self.datums
            .get_mut(&id)
            .ok_or_else(|| AdlbError::NotFound(format!("datum {id}")))
    }

    fn check_subscript_len(sub: &[u8]) -> Result<()> {
        if sub.len() > MAX_SUBSCRIPT_LEN {
            return Err(AdlbError::Limit(format!(
                "subscript length {} exceeds {}",
                sub.len(),
                MAX_SUBSCRIPT_LEN
            )));
        }
        Ok(())
    }

    /// Whether the datum (or, if `sub` given, the subscript) has been set;
    /// applies `decr` atomically on success (spec §4.4 `exists`).
    pub fn exists(&mut self, id: u64, sub: Option<&[u8]>, decr: RefDelta) -> Result<bool> {
        let present = {
            let datum = self.get(id)?;
            match sub {
                None => !matches!(datum.payload, Payload::ScalarUnset),
                Some(s) => slot_at(&datum.payload, s)?.map(|slot| slot.is_set()).unwrap_or(false),
            }
        };
        if present && decr != RefDelta::NONE {
            self.refcount_incr(id, RefDelta { read: -decr.read, write: -decr.write })?;
        }
        Ok(present)
    }

    /// Write a scalar or assign a subscript (spec §4.4 `store`).
    pub fn store(
        &mut self,
        id: u64,
        sub: Option<&[u8]>,
        dtype: DatumType,
        bytes: &[u8],
        decr: RefDelta,
        store_refs: RefCounts,
    ) -> Result<NotifSet> {
        if let Some(s) = sub {
            Self::check_subscript_len(s)?;
        }
        let value = Value::decode(dtype, bytes)?;
        let datum = self.get_mut(id)?;

        let assigned_path: Subscript = match sub {
            None => {
                if !matches!(datum.payload, Payload::ScalarUnset) {
                    return Err(AdlbError::DoubleWrite { id, sub: None });
                }
                datum.payload = Payload::Scalar(value.clone());
                Vec::new()
            }
            Some(s) => {
                assign_at(&mut datum.payload, s, value.clone())
                    .map_err(|_| AdlbError::DoubleWrite { id, sub: Some(s.to_vec()) })?;
                s.to_vec()
            }
        };

        let mut notif = self.fire_listeners(id, &assigned_path)?;

        if store_refs.read != 0 || store_refs.write != 0 {
            if let Some(referand) = value.referand() {
                notif.refc_changes.push((referand, RefDelta { read: store_refs.read, write: store_refs.write }, true));
            }
        }
        if decr != RefDelta::NONE {
            notif.refc_changes.push((id, RefDelta { read: -decr.read, write: -decr.write }, false));
        }
        Ok(notif)
    }

    /// Remove and return listeners whose key is a byte-prefix of
    /// `assigned_path`, converting each into a notification-set entry.
    fn fire_listeners(&mut self, id: u64, assigned_path: &[u8]) -> Result<NotifSet> {
        let datum = self.get_mut(id)?;
        let mut remaining = Vec::with_capacity(datum.listeners.len());
        let mut fired = Vec::new();
        for (key, listener) in datum.listeners.drain(..) {
            if assigned_path.starts_with(key.as_slice()) {
                fired.push(listener);
            } else {
                remaining.push((key, listener));
            }
        }
        datum.listeners = remaining;

        let mut notif = NotifSet::default();
        for listener in fired {
            match listener {
                Listener::Notify { rank, work_type } => {
                    notif.notify.push((rank, id, assigned_path.to_vec(), work_type));
                }
                Listener::Reference { ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr } => {
                    let bytes = self.read_bytes_at(id, if assigned_path.is_empty() { None } else { Some(assigned_path) })?;
                    notif
                        .references
                        .push((ref_id, ref_sub, ref_type, bytes, transfer_refs, ref_write_decr));
                }
            }
        }
        Ok(notif)
    }

    fn read_bytes_at(&self, id: u64, sub: Option<&[u8]>) -> Result<Vec<u8>> {
        let datum = self.get(id)?;
        match sub {
            None => match &datum.payload {
                Payload::Scalar(v) => Ok(v.encode()),
                _ => Err(AdlbError::Unset(id)),
            },
            Some(s) => match slot_at(&datum.payload, s)? {
                Some(Slot::Scalar(v)) => Ok(v.encode()),
                Some(Slot::Reserved) | None => {
                    Err(AdlbError::SubscriptNotFound { id, sub: s.to_vec() })
                }
                Some(Slot::Compound(_)) => Err(AdlbError::TypeMismatch(id, "compound slot has no scalar bytes".into())),
            },
        }
    }

    /// Copy bytes out, applying self-decrement and referand-increment
    /// atomically on success (spec §4.4 `retrieve`).
    pub fn retrieve(
        &mut self,
        id: u64,
        sub: Option<&[u8]>,
        decr: RefDelta,
        incr_referand: RefDelta,
    ) -> Result<(DatumType, Vec<u8>)> {
        let bytes = self.read_bytes_at(id, sub)?;
        let dtype = match sub {
            None => self.get(id)?.dtype,
            Some(s) => match slot_at(&self.get(id)?.payload, s)? {
                Some(Slot::Scalar(v)) => v.dtype(),
                _ => unreachable!("read_bytes_at would have errored"),
            },
        };

        if decr != RefDelta::NONE {
            self.refcount_incr(id, RefDelta { read: -decr.read, write: -decr.write })?;
        }
        if incr_referand != RefDelta::NONE {
            if let Ok(value) = Value::decode(dtype, &bytes) {
                if let Some(referand) = value.referand() {
                    self.refcount_incr(referand, incr_referand)?;
                }
            }
        }
        Ok((dtype, bytes))
    }

    /// Reserve a subscript if absent (spec §4.4 `insert_atomic`).
    pub fn insert_atomic(&mut self, id: u64, sub: &[u8], refcounts: RefCounts) -> Result<InsertAtomicResult> {
        Self::check_subscript_len(sub)?;
        let datum = self.get_mut(id)?;
        match &mut datum.payload {
            Payload::Container(map) => {
                if let Some(slot) = map.get(sub) {
                    let present = slot.is_set();
                    let value = match slot {
                        Slot::Scalar(v) => Some(v.encode()),
                        _ => None,
                    };
                    return Ok(InsertAtomicResult { created: false, present, value });
                }
                map.insert(sub.to_vec(), Slot::Reserved);
                let _ = refcounts;
                Ok(InsertAtomicResult { created: true, present: false, value: None })
            }
            _ => Err(AdlbError::TypeMismatch(id, "insert_atomic requires a container".into())),
        }
    }

    /// Register `rank` as a notify listener on `id[sub]`; returns `false`
    /// if the event has already occurred (spec §4.4 `subscribe`).
    pub fn subscribe(&mut self, id: u64, sub: Option<&[u8]>, rank: Rank, work_type: i32) -> Result<bool> {
        let already = match sub {
            None => self.get(id)?.closed(),
            Some(s) => self
                .exists(id, Some(s), RefDelta::NONE)?,
        };
        if already {
            return Ok(false);
        }
        let datum = self.get_mut(id)?;
        let key = sub.map(|s| s.to_vec()).unwrap_or_default();
        if !key.is_empty() {
            datum.subscript_notifs = true;
        }
        datum.listeners.push((key, Listener::Notify { rank, work_type }));
        Ok(true)
    }

    /// Register that `ref_id[ref_sub]` shall be assigned `id[sub]`'s value
    /// once it is set; fires immediately (via the returned `NotifSet`) if
    /// already present (spec §4.4 `container_reference`).
    #[allow(clippy::too_many_arguments)]
    pub fn container_reference(
        &mut self,
        id: u64,
        sub: &[u8],
        ref_id: u64,
        ref_sub: Subscript,
        ref_type: DatumType,
        transfer_refs: RefCounts,
        ref_write_decr: i64,
    ) -> Result<NotifSet> {
        Self::check_subscript_len(sub)?;
        if self.exists(id, Some(sub), RefDelta::NONE)? {
            let bytes = self.read_bytes_at(id, Some(sub))?;
            let mut notif = NotifSet::default();
            notif
                .references
                .push((ref_id, ref_sub, ref_type, bytes, transfer_refs, ref_write_decr));
            return Ok(notif);
        }
        let datum = self.get_mut(id)?;
        datum.subscript_notifs = true;
        datum.listeners.push((
            sub.to_vec(),
            Listener::Reference { ref_id, ref_sub, ref_type, transfer_refs, ref_write_decr },
        ));
        Ok(NotifSet::default())
    }

    /// Adjust read/write refcounts, applying the discipline in spec §4.4
    /// "Refcount discipline": read delta applied only if read-refcounting
    /// is globally enabled and the datum isn't permanent; write never goes
    /// negative (fatal if it would), write reaching 0 emits the closed
    /// event, both reaching 0 (and not permanent) destroys the datum,
    /// recursively decrementing referands and accumulating their
    /// notifications.
    pub fn refcount_incr(&mut self, id: u64, delta: RefDelta) -> Result<NotifSet> {
        let mut notif = NotifSet::default();
        let read_refc_enabled = self.read_refc_enabled;
        let datum = self.get_mut(id)?;

        if read_refc_enabled && !datum.permanent {
            datum.read_refcount += delta.read;
        }
        let new_write = datum.write_refcount + delta.write;
        if new_write < 0 {
            return Err(AdlbError::RefcountNegative(id));
        }
        let was_closed = datum.closed();
        datum.write_refcount = new_write;

        if datum.closed() && !was_closed {
            let assigned_path = Vec::new();
            notif.extend(self.fire_listeners(id, &assigned_path)?);
            let datum = self.get(id)?;
            if datum.release_write_refs {
                for referand in collect_referands(&datum.payload) {
                    notif.refc_changes.push((referand, RefDelta { read: 0, write: -1 }, false));
                }
            }
        }

        if self.get(id)?.garbage() {
            self.destroy(id, &mut notif)?;
        }
        Ok(notif)
    }

    fn destroy(&mut self, id: u64, notif: &mut NotifSet) -> Result<()> {
        let datum = match self.datums.remove(&id) {
            Some(d) => d,
            None => return Ok(()),
        };
        if !datum.listeners.is_empty() {
            // An un-fulfilled listener of any kind at destruction is a user
            // bug (spec §3.2 invariant 5); surfaced, not silently dropped.
            return Err(AdlbError::Unresolved { id, sub: None });
        }
        for referand in collect_referands(&datum.payload) {
            let sub_notif = self.refcount_incr(referand, RefDelta { read: -1, write: 0 })?;
            notif.extend(sub_notif);
        }
        Ok(())
    }

    /// Current `(read, write)` refcounts, applying `decr` first (spec §4.4
    /// `refcount_get`).
    pub fn refcount_get(&mut self, id: u64, decr: RefDelta) -> Result<(i64, i64)> {
        if decr != RefDelta::NONE {
            self.refcount_incr(id, RefDelta { read: -decr.read, write: -decr.write })?;
        }
        match self.datums.get(&id) {
            Some(d) => Ok((d.read_refcount, d.write_refcount)),
            None => Ok((0, 0)),
        }
    }

    /// Advisory lock: records `rank` as the owner if unlocked.
    pub fn lock(&mut self, id: u64, rank: Rank) -> Result<bool> {
        match self.locks.get(&id) {
            Some(owner) if *owner != rank => Ok(false),
            _ => {
                self.locks.insert(id, rank);
                Ok(true)
            }
        }
    }

    /// Release the advisory lock on `id`.
    pub fn unlock(&mut self, id: u64) -> Result<()> {
        self.locks.remove(&id);
        Ok(())
    }

    /// Check every remaining datum for unresolved listeners, as finalize
    /// must (spec §3.2 invariant 5, §7 Testable Property 4). Returns one
    /// `(id, diagnostic)` pair per outstanding listener, distinguishing an
    /// unfilled subscribe from an unfilled `container_reference`.
    pub fn unresolved_at_finalize(&self) -> Vec<(u64, &'static str)> {
        self.datums
            .iter()
            .flat_map(|(id, d)| {
                d.listeners.iter().map(move |(_, listener)| {
                    let diagnostic = match listener {
                        Listener::Notify { .. } => "unfilled subscribe",
                        Listener::Reference { .. } => "UNFILLED CONTAINER REFERENCE",
                    };
                    (*id, diagnostic)
                })
            })
            .collect()
    }

    /// Number of live datums, for leak reporting (`ADLB_REPORT_LEAKS`).
    pub fn live_count(&self) -> usize {
        self.datums.len()
    }
}

fn collect_referands(payload: &Payload) -> Vec<u64> {
    let mut out = Vec::new();
    collect_referands_into(payload, &mut out);
    out
}

fn collect_referands_into(payload: &Payload, out: &mut Vec<u64>) {
    match payload {
        Payload::Scalar(Value::Reference(id)) => out.push(*id),
        Payload::Container(map) => {
            for slot in map.values() {
                collect_slot_referands(slot, out);
            }
        }
        Payload::Multiset(values) => {
            for v in values {
                if let Value::Reference(id) = v {
                    out.push(*id);
                }
            }
        }
        Payload::Struct { fields, .. } => {
            for slot in fields {
                collect_slot_referands(slot, out);
            }
        }
        _ => {}
    }
}

fn collect_slot_referands(slot: &Slot, out: &mut Vec<u64>) {
    match slot {
        Slot::Scalar(Value::Reference(id)) => out.push(*id),
        Slot::Compound(p) => collect_referands_into(p, out),
        _ => {}
    }
}

/// Parse the leading dotted-integer struct index, returning it plus the
/// remaining subscript bytes (after the dot), if any.
fn parse_struct_index(sub: &[u8]) -> Result<(usize, Option<&[u8]>)> {
    let dot = sub.iter().position(|&b| b == b'.');
    let (head, rest) = match dot {
        Some(i) => (&sub[..i], Some(&sub[i + 1..])),
        None => (sub, None),
    };
    let s = std::str::from_utf8(head).map_err(|e| AdlbError::Invalid(e.to_string()))?;
    let idx: usize = s.parse().map_err(|_| AdlbError::Invalid(format!("bad struct index {s:?}")))?;
    Ok((idx, rest))
}

/// Read-only traversal: find the slot a subscript addresses, if any level
/// along the path exists. `None` means the subscript was never reserved.
fn slot_at<'a>(payload: &'a Payload, sub: &[u8]) -> Result<Option<&'a Slot>> {
    match payload {
        Payload::Container(map) => Ok(map.get(sub)),
        Payload::Struct { field_types, fields } => {
            let (idx, rest) = parse_struct_index(sub)?;
            if idx >= field_types.len() {
                return Err(AdlbError::Invalid(format!("struct index {idx} out of range")));
            }
            match (&fields[idx], rest) {
                (slot, None) => Ok(Some(slot)),
                (Slot::Compound(nested), Some(rest)) => slot_at(nested, rest),
                (Slot::Reserved, Some(_)) => Ok(None),
                (Slot::Scalar(_), Some(_)) => Err(AdlbError::Invalid("cannot descend into a scalar field".into())),
            }
        }
        _ => Err(AdlbError::Invalid("subscript given on a non-compound datum".into())),
    }
}

/// Assign `value` at `sub`, auto-initializing uninitialized compound
/// intermediate fields (spec §4.4 "Subscript semantics"). Errors (double
/// write) are signalled by `Err(())`; the caller maps that to
/// `AdlbError::DoubleWrite` with the right context.
fn assign_at(payload: &mut Payload, sub: &[u8], value: Value) -> std::result::Result<(), ()> {
    match payload {
        Payload::Container(map) => match map.get(sub) {
            Some(Slot::Scalar(_)) | Some(Slot::Compound(_)) => Err(()),
            _ => {
                map.insert(sub.to_vec(), Slot::Scalar(value));
                Ok(())
            }
        },
        Payload::Struct { field_types, fields } => {
            let (idx, rest) = parse_struct_index(sub).map_err(|_| ())?;
            if idx >= field_types.len() {
                return Err(());
            }
            match rest {
                None => match &fields[idx] {
                    Slot::Scalar(_) | Slot::Compound(_) => Err(()),
                    Slot::Reserved => {
                        fields[idx] = Slot::Scalar(value);
                        Ok(())
                    }
                },
                Some(rest) => {
                    let field_ty = field_types[idx];
                    if !matches!(field_ty, DatumType::Container | DatumType::Struct | DatumType::Multiset) {
                        return Err(());
                    }
                    if matches!(fields[idx], Slot::Reserved) {
                        fields[idx] = Slot::Compound(Box::new(Payload::new_unset(field_ty, None)));
                    }
                    match &mut fields[idx] {
                        Slot::Compound(nested) => assign_at(nested, rest, value),
                        _ => Err(()),
                    }
                }
            }
        }
        Payload::ScalarUnset => Err(()),
        Payload::Scalar(_) => Err(()),
        Payload::Multiset(values) => {
            // Multisets are appended to as a whole, never addressed by a
            // per-member subscript store in this core.
            let _ = sub;
            values.push(value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_default() -> DataStore {
        DataStore::new(0, 1)
    }

    #[test]
    fn single_assignment_e1() {
        let mut store = store_default();
        let id = store
            .create(Some(1), DatumType::Integer, CreateProps::default_counts())
            .unwrap();
        let notif = store
            .store(id, None, DatumType::Integer, b"42", RefDelta::NONE, RefCounts::default())
            .unwrap();
        assert!(notif.notify.is_empty());
        let (dtype, bytes) = store.retrieve(id, None, RefDelta::NONE, RefDelta::NONE).unwrap();
        assert_eq!(dtype, DatumType::Integer);
        assert_eq!(bytes, b"42");

        let err = store
            .store(id, None, DatumType::Integer, b"7", RefDelta::NONE, RefCounts::default())
            .unwrap_err();
        assert!(matches!(err, AdlbError::DoubleWrite { .. }));
    }

    #[test]
    fn container_notification_e2() {
        let mut store = store_default();
        let id = store
            .create(Some(10), DatumType::Container, CreateProps::default_counts())
            .unwrap();
        assert!(store.subscribe(id, Some(b"foo"), 2, 0).unwrap());
        let notif = store
            .store(id, Some(b"foo"), DatumType::Integer, b"7", RefDelta::NONE, RefCounts::default())
            .unwrap();
        assert_eq!(notif.notify.len(), 1);
        assert_eq!(notif.notify[0], (2, 10, b"foo".to_vec(), 0));
    }

    #[test]
    fn reference_transfer_e4() {
        let mut store = store_default();
        let refid = store
            .create(Some(30), DatumType::Integer, CreateProps::default_counts())
            .unwrap();
        let cid = store
            .create(Some(40), DatumType::Container, CreateProps::default_counts())
            .unwrap();

        let notif = store
            .container_reference(
                cid,
                b"k",
                refid,
                Vec::new(),
                DatumType::Reference,
                RefCounts { read: 1, write: 1 },
                1,
            )
            .unwrap();
        assert!(notif.references.is_empty());

        let store_notif = store
            .store(
                cid,
                Some(b"k"),
                DatumType::Reference,
                &99i64.to_le_bytes(),
                RefDelta::NONE,
                RefCounts::default(),
            )
            .unwrap();
        assert_eq!(store_notif.references.len(), 0);
        // container_reference listener is fired via fire_listeners ->
        // notif.references, not via store_refs, so check there instead:
        let mut store2 = store_default();
        let refid2 = store2
            .create(Some(30), DatumType::Integer, CreateProps::default_counts())
            .unwrap();
        let cid2 = store2
            .create(Some(40), DatumType::Container, CreateProps::default_counts())
            .unwrap();
        store2
            .container_reference(
                cid2,
                b"k",
                refid2,
                Vec::new(),
                DatumType::Reference,
                RefCounts { read: 1, write: 1 },
                1,
            )
            .unwrap();
        let notif2 = store2
            .store(
                cid2,
                Some(b"k"),
                DatumType::Reference,
                &99i64.to_le_bytes(),
                RefDelta::NONE,
                RefCounts::default(),
            )
            .unwrap();
        assert_eq!(notif2.references.len(), 1);
    }

    #[test]
    fn insert_atomic_at_most_once() {
        let mut store = store_default();
        let id = store
            .create(Some(50), DatumType::Container, CreateProps::default_counts())
            .unwrap();
        let r1 = store.insert_atomic(id, b"k", RefCounts::default()).unwrap();
        assert!(r1.created);
        let r2 = store.insert_atomic(id, b"k", RefCounts::default()).unwrap();
        assert!(!r2.created);
    }

    #[test]
    fn refcount_never_negative() {
        let mut store = store_default();
        let id = store
            .create(Some(60), DatumType::Integer, CreateProps::default_counts())
            .unwrap();
        let err = store.refcount_incr(id, RefDelta { read: 0, write: -2 }).unwrap_err();
        assert!(matches!(err, AdlbError::RefcountNegative(_)));
    }

    #[test]
    fn struct_nested_dotted_subscript() {
        let mut store = store_default();
        let id = store
            .create(
                Some(70),
                DatumType::Struct,
                CreateProps {
                    field_types: Some(vec![DatumType::Integer, DatumType::Struct]),
                    ..CreateProps::default_counts()
                },
            )
            .unwrap();
        // Outer field 1 is itself a struct; but since structs need their
        // own field_types, only scalar fields are exercised at the outer
        // level and compound auto-init is exercised for Container here:
        let id2 = store
            .create(
                Some(71),
                DatumType::Struct,
                CreateProps {
                    field_types: Some(vec![DatumType::Integer, DatumType::Container]),
                    ..CreateProps::default_counts()
                },
            )
            .unwrap();
        store
            .store(id2, Some(b"1.foo"), DatumType::Integer, b"5", RefDelta::NONE, RefCounts::default())
            .unwrap();
        let (_, bytes) = store.retrieve(id2, Some(b"1.foo"), RefDelta::NONE, RefDelta::NONE).unwrap();
        assert_eq!(bytes, b"5");
        let _ = id;
    }
}
