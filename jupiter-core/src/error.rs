//! Error taxonomy for the consistency engine.
//!
//! Every variant here means the affected replica can no longer be trusted.
//! None of them are retried or repaired in place: the session layer reacts
//! by resynchronizing the replica from the authoritative copy.

use thiserror::Error;
use uuid::Uuid;

use crate::jupiter::Timestamp;

/// Errors raised by the operation algebra, the state machine and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// A request was generated in a causal context this side never had
    /// (out-of-order, duplicated or stale delivery).
    #[error(
        "causality violation: request stamped {received} but local state is {expected} \
         (acknowledged up to {acked})"
    )]
    Causality {
        received: Timestamp,
        expected: Timestamp,
        acked: u64,
    },

    /// An operation addresses characters past the end of the document.
    #[error("operation out of range: position {position} + length {length} exceeds document length {doc_len}")]
    OutOfRange {
        position: usize,
        length: usize,
        doc_len: usize,
    },

    /// The characters removed by a delete differ from the ones it carries.
    #[error("delete at {position} expected {expected:?} but document holds {found:?}")]
    DeleteMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("unknown client {0}")]
    UnknownClient(Uuid),

    #[error("client {0} is already registered")]
    DuplicateClient(Uuid),

    /// Local edits are refused while a replica waits for an authoritative copy.
    #[error("replica is being resynchronized")]
    ResyncInProgress,
}

impl OtError {
    /// Whether the error means the replica diverged and needs a full resync.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::Causality { .. } | Self::OutOfRange { .. } | Self::DeleteMismatch { .. }
        )
    }
}

pub type OtResult<T> = Result<T, OtError>;
