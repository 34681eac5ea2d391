//! Document checksums for divergence detection.
//!
//! The relay periodically sends each client a checksum of the authoritative
//! document, stamped with the proxy's timestamp. A client only compares it
//! when it has reached exactly that state with nothing of its own in flight;
//! any other comparison would report false divergence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::jupiter::Timestamp;

/// Length plus blake3 hash of a document's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Length in bytes of the UTF-8 content.
    pub length: u64,
    pub hash: [u8; 32],
}

impl Checksum {
    pub fn of(content: &str) -> Self {
        Self {
            length: content.len() as u64,
            hash: *blake3::hash(content.as_bytes()).as_bytes(),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b:", self.length)?;
        for byte in &self.hash[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A checksum as observed by one side of a link at a given timestamp.
///
/// The timestamp is from the sender's point of view, exactly like a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedChecksum {
    pub checksum: Checksum,
    pub timestamp: Timestamp,
}
