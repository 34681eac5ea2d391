//! Jupiter state machine: one per end of a client↔server link.
//!
//! Each side counts the operations it generated (`local_count`) and the
//! remote operations it incorporated (`remote_count`). Every request is
//! stamped with the sender's pair, which tells the receiver exactly which of
//! its own operations the sender had already seen:
//!
//! ```text
//!   client                                 server proxy
//!   generate(a) ── (a, [0,0]) ──┐   ┌── (b, [0,0]) ── generate(b)
//!   outstanding: [a]            │   │   outstanding: [b]
//!                               ╳
//!   receive(b): b' = IT(b, a) ◄─┘   └─► receive(a): a' = IT(a, b)
//!               a  = IT(a, b)                       b  = IT(b, a)
//! ```
//!
//! Operations the remote has not seen yet stay in `outstanding` and are
//! transformed in place as remote operations arrive, so the queue always
//! describes them relative to the current document.
//!
//! Reference: Nichols, Curtis, Dixon, Lamping — "High-Latency, Low-Bandwidth
//! Windowing in the Jupiter Collaboration System" (UIST 1995)

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OtError, OtResult};
use crate::operation::Operation;
use crate::transform::{xform, Tie};

/// Causal context of a request, from its sender's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Operations the sender had generated before this one.
    pub local_count: u64,
    /// Operations of the receiver the sender had incorporated.
    pub remote_count: u64,
}

impl Timestamp {
    pub fn new(local_count: u64, remote_count: u64) -> Self {
        Self {
            local_count,
            remote_count,
        }
    }

    /// The same point in time seen from the other end of the link.
    pub fn mirrored(self) -> Self {
        Self::new(self.remote_count, self.local_count)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.local_count, self.remote_count)
    }
}

/// The unit exchanged over a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    pub timestamp: Timestamp,
}

/// Which end of the link a state machine sits on.
///
/// Concurrent inserts at the same position are ordered server-first: the
/// operation that already passed through the relay keeps its place and the
/// client's text lands after it. Both ends derive the same order from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Tie rule for an incoming remote operation transformed against a local one.
    fn remote_tie(self) -> Tie {
        match self {
            Self::Client => Tie::OpFirst,
            Self::Server => Tie::AppliedFirst,
        }
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    /// `local_count` when the operation was generated.
    local_count: u64,
    operation: Operation,
}

/// Per-link synchronization state.
#[derive(Debug, Clone)]
pub struct Jupiter {
    side: Side,
    local_count: u64,
    remote_count: u64,
    acked_local_count: u64,
    outstanding: VecDeque<Outstanding>,
}

impl Jupiter {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            local_count: 0,
            remote_count: 0,
            acked_local_count: 0,
            outstanding: VecDeque::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.local_count, self.remote_count)
    }

    pub fn acked_local_count(&self) -> u64 {
        self.acked_local_count
    }

    /// Number of local operations the remote has not acknowledged yet.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_quiescent(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Stamp a local operation for transmission.
    ///
    /// The caller has already applied `operation` to its replica; local edits
    /// never wait for the remote.
    pub fn generate(&mut self, operation: Operation) -> Request {
        let request = Request {
            operation: operation.clone(),
            timestamp: self.timestamp(),
        };
        self.outstanding.push_back(Outstanding {
            local_count: self.local_count,
            operation,
        });
        self.local_count += 1;
        request
    }

    /// Incorporate a remote request, returning the operation to apply locally.
    ///
    /// Requests must arrive in the order they were generated. Anything else
    /// is a causality violation and leaves this state untouched.
    pub fn receive(&mut self, request: &Request) -> OtResult<Operation> {
        self.check_causality(request.timestamp)?;
        self.discard_acknowledged(request.timestamp.remote_count);

        let tie = self.side.remote_tie();
        let mut operation = request.operation.clone();
        for entry in self.outstanding.iter_mut() {
            let (remote, local) = xform(&operation, &entry.operation, tie);
            operation = remote;
            entry.operation = local;
        }

        self.remote_count += 1;
        log::trace!(
            "{:?} jupiter received {} at {} -> {}",
            self.side,
            request.operation,
            request.timestamp,
            operation
        );
        Ok(operation)
    }

    /// The remote has incorporated `count` of our operations.
    ///
    /// Stale acknowledgments are ignored; one for operations never generated
    /// is a causality violation.
    pub fn acknowledge(&mut self, count: u64) -> OtResult<()> {
        if count > self.local_count {
            return Err(OtError::Causality {
                received: Timestamp::new(self.remote_count, count),
                expected: self.timestamp(),
                acked: self.acked_local_count,
            });
        }
        self.discard_acknowledged(count);
        Ok(())
    }

    /// Forget all history, as after a full resynchronization.
    pub fn reset(&mut self) {
        *self = Self::new(self.side);
    }

    fn check_causality(&self, received: Timestamp) -> OtResult<()> {
        let in_order = received.local_count == self.remote_count;
        let known = received.remote_count <= self.local_count;
        let fresh = received.remote_count >= self.acked_local_count;
        if in_order && known && fresh {
            Ok(())
        } else {
            Err(OtError::Causality {
                received,
                expected: self.timestamp(),
                acked: self.acked_local_count,
            })
        }
    }

    fn discard_acknowledged(&mut self, count: u64) {
        while self
            .outstanding
            .front()
            .is_some_and(|entry| entry.local_count < count)
        {
            self.outstanding.pop_front();
        }
        self.acked_local_count = self.acked_local_count.max(count);
    }
}
