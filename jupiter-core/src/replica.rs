//! Client-side replica: a document paired with the client end of a link.

use crate::checksum::StampedChecksum;
use crate::document::Document;
use crate::error::{OtError, OtResult};
use crate::jupiter::{Jupiter, Request, Side, Timestamp};
use crate::operation::Operation;

/// Outcome of comparing a relay checksum with the local document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumCheck {
    Consistent,
    /// The replica diverged and is now waiting for an authoritative copy.
    Diverged,
    /// The checksum describes a state this replica is not in right now.
    Skipped,
}

/// A site's document together with its Jupiter state.
///
/// Single-writer: wrap it in a mutex (or own it from one task) when edits and
/// incoming requests come from different threads.
#[derive(Debug, Clone)]
pub struct ClientReplica {
    document: Document,
    jupiter: Jupiter,
    resyncing: bool,
}

impl ClientReplica {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            document: Document::new(content),
            jupiter: Jupiter::new(Side::Client),
            resyncing: false,
        }
    }

    pub fn content(&self) -> &str {
        self.document.content()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn timestamp(&self) -> Timestamp {
        self.jupiter.timestamp()
    }

    pub fn jupiter(&self) -> &Jupiter {
        &self.jupiter
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Apply a local edit at once and stamp it for the relay.
    pub fn edit(&mut self, operation: Operation) -> OtResult<Request> {
        if self.resyncing {
            return Err(OtError::ResyncInProgress);
        }
        self.document.apply(&operation)?;
        Ok(self.jupiter.generate(operation))
    }

    /// Incorporate a request from the relay, returning what was applied.
    ///
    /// Requests that arrive while waiting for a resync describe a state that
    /// is about to be replaced and are dropped as `NoOp`. Any error switches
    /// the replica into resync mode.
    pub fn receive(&mut self, request: &Request) -> OtResult<Operation> {
        if self.resyncing {
            log::debug!("dropping request {} while resyncing", request.timestamp);
            return Ok(Operation::NoOp);
        }
        let result = self
            .jupiter
            .receive(request)
            .and_then(|operation| self.document.apply(&operation).map(|()| operation));
        if let Err(ref err) = result {
            log::warn!("replica diverged: {err}");
            self.resyncing = true;
        }
        result
    }

    pub fn acknowledge(&mut self, count: u64) -> OtResult<()> {
        if self.resyncing {
            return Ok(());
        }
        self.jupiter.acknowledge(count).inspect_err(|_| {
            self.resyncing = true;
        })
    }

    /// Compare a checksum taken by the relay at a given link state.
    pub fn verify(&mut self, stamped: &StampedChecksum) -> ChecksumCheck {
        if self.resyncing || stamped.timestamp.mirrored() != self.jupiter.timestamp() {
            return ChecksumCheck::Skipped;
        }
        if stamped.checksum == self.document.checksum() {
            // The relay has seen every local operation at this point; the
            // mirrored stamp makes the count equal to our own local count.
            let acked = self.jupiter.acknowledge(stamped.timestamp.remote_count);
            debug_assert!(acked.is_ok(), "checksum acknowledgment rejected: {acked:?}");
            ChecksumCheck::Consistent
        } else {
            log::warn!(
                "checksum mismatch at {}: relay {} local {}",
                self.jupiter.timestamp(),
                stamped.checksum,
                self.document.checksum()
            );
            self.resyncing = true;
            ChecksumCheck::Diverged
        }
    }

    /// Stop accepting edits until [`ClientReplica::resync`] arrives.
    pub fn begin_resync(&mut self) {
        self.resyncing = true;
    }

    /// Replace the content with an authoritative copy and restart the link.
    pub fn resync(&mut self, content: impl Into<String>) {
        self.document.replace(content);
        self.jupiter.reset();
        self.resyncing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    #[test]
    fn test_edit_applies_immediately() {
        let mut replica = ClientReplica::new("abc");
        let request = replica.edit(Operation::insert(3, "d")).unwrap();
        assert_eq!(replica.content(), "abcd");
        assert_eq!(request.timestamp, Timestamp::new(0, 0));
        assert_eq!(replica.timestamp(), Timestamp::new(1, 0));
    }

    #[test]
    fn test_invalid_edit_not_queued() {
        let mut replica = ClientReplica::new("abc");
        assert!(replica.edit(Operation::delete(2, "cd")).is_err());
        assert_eq!(replica.timestamp(), Timestamp::default());
        assert!(replica.jupiter().is_quiescent());
    }

    #[test]
    fn test_causality_error_enters_resync() {
        let mut replica = ClientReplica::new("abc");
        let bogus = Request {
            operation: Operation::insert(0, "x"),
            timestamp: Timestamp::new(4, 0),
        };
        assert!(replica.receive(&bogus).unwrap_err().requires_resync());
        assert!(replica.is_resyncing());
        assert_eq!(
            replica.edit(Operation::insert(0, "y")),
            Err(OtError::ResyncInProgress)
        );
        assert_eq!(replica.receive(&bogus), Ok(Operation::NoOp));

        replica.resync("fresh");
        assert!(!replica.is_resyncing());
        assert_eq!(replica.content(), "fresh");
        assert_eq!(replica.timestamp(), Timestamp::default());
    }

    #[test]
    fn test_verify_matching_checksum() {
        let mut replica = ClientReplica::new("abc");
        replica.edit(Operation::insert(0, "x")).unwrap();
        let stamped = StampedChecksum {
            checksum: Checksum::of("xabc"),
            timestamp: Timestamp::new(0, 1),
        };
        assert_eq!(replica.verify(&stamped), ChecksumCheck::Consistent);
        assert!(replica.jupiter().is_quiescent());
        assert_eq!(replica.jupiter().acked_local_count(), 1);
        assert!(!replica.is_resyncing());
    }

    #[test]
    fn test_verify_skips_other_states() {
        let mut replica = ClientReplica::new("abc");
        replica.edit(Operation::insert(0, "x")).unwrap();
        // Taken before the relay saw our insert.
        let stamped = StampedChecksum {
            checksum: Checksum::of("abc"),
            timestamp: Timestamp::new(0, 0),
        };
        assert_eq!(replica.verify(&stamped), ChecksumCheck::Skipped);
        assert!(!replica.is_resyncing());
    }

    #[test]
    fn test_verify_detects_divergence() {
        let mut replica = ClientReplica::new("abc");
        let stamped = StampedChecksum {
            checksum: Checksum::of("abd"),
            timestamp: Timestamp::default(),
        };
        assert_eq!(replica.verify(&stamped), ChecksumCheck::Diverged);
        assert!(replica.is_resyncing());
    }
}
