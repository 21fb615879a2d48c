//! Error taxonomy for the data store and task queue
//!
//! User errors are returned to the calling worker as ordinary result codes;
//! they are never fatal to a server. System errors and the refcount
//! invariant violation are fatal and drive the server into shutdown.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, AdlbError>;

/// Errors surfaced by the data store, work queue, and sync protocol.
#[derive(Debug, Error)]
pub enum AdlbError {
    /// A `create` was issued for an id that already exists.
    #[error("double declare: datum {0} already exists")]
    DoubleDeclare(u64),

    /// A scalar or subscript was stored to more than once.
    #[error("double write: datum {id} subscript {sub:?}")]
    DoubleWrite {
        /// Datum id.
        id: u64,
        /// Subscript bytes, if any.
        sub: Option<Vec<u8>>,
    },

    /// A subscript was reserved but never set, or does not exist.
    #[error("subscript not found: datum {id} subscript {sub:?}")]
    SubscriptNotFound {
        /// Datum id.
        id: u64,
        /// Subscript bytes.
        sub: Vec<u8>,
    },

    /// Retrieve of a datum whose scalar payload has not been set.
    #[error("datum {0} is unset")]
    Unset(u64),

    /// Operation applied to a datum of the wrong type.
    #[error("type mismatch on datum {0}: {1}")]
    TypeMismatch(u64, String),

    /// Malformed request (bad subscript, bad opts, ...).
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A refcount delta would have driven a count negative.
    ///
    /// Fatal: the server that observes this logs, marks itself for
    /// shutdown, and the master process exits non-zero.
    #[error("refcount would go negative: datum {0}")]
    RefcountNegative(u64),

    /// At finalize, a listener or container reference was never fulfilled.
    #[error("unresolved: datum {id} subscript {sub:?} never assigned")]
    Unresolved {
        /// Datum id.
        id: u64,
        /// Subscript bytes, if any.
        sub: Option<Vec<u8>>,
    },

    /// A configured capacity was exceeded (e.g. subscript > 1024 bytes).
    #[error("limit exceeded: {0}")]
    Limit(String),

    /// Caller-provided buffer too small for the result.
    #[error("buffer too small: need {needed}, have {have}")]
    BufferTooSmall {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// A numeric payload failed to parse.
    #[error("number format error: {0}")]
    NumberFormat(String),

    /// Allocation failure / resource exhaustion.
    #[error("out of memory")]
    Oom,

    /// Referenced id, rank, or handle does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all for conditions that should not occur.
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Wire (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl AdlbError {
    /// Whether this error is fatal to the process (vs. a recoverable user
    /// error returned to the caller).
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdlbError::RefcountNegative(_) | AdlbError::Oom)
    }
}
