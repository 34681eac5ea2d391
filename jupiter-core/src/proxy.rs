//! Server relay: one Jupiter proxy per connected client.
//!
//! ```text
//!             ┌───────────── ProxyRegistry ─────────────┐
//! client A ──►│ proxy A ─ receive ─► op ─► document     │
//!             │                      │                  │
//!             │            ┌─────────┴─────────┐        │
//!             │            ▼                   ▼        │
//!             │   proxy B generate    proxy C generate  │
//!             └────────────┼───────────────────┼────────┘
//!                          ▼                   ▼
//!                      client B            client C
//! ```
//!
//! The registry is the serialization point of a session: it owns the
//! authoritative document every proxy refers to, and every request passes
//! through it one at a time.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::checksum::StampedChecksum;
use crate::document::Document;
use crate::error::{OtError, OtResult};
use crate::jupiter::{Jupiter, Request, Side};

pub type ClientId = Uuid;

/// Per-session collection of server-side proxies.
#[derive(Debug, Clone)]
pub struct ProxyRegistry {
    document: Document,
    /// Ordered so fan-out is deterministic.
    proxies: BTreeMap<ClientId, Jupiter>,
}

impl ProxyRegistry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            document: Document::new(content),
            proxies: BTreeMap::new(),
        }
    }

    /// The authoritative document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Content a joining or resynchronizing client starts from.
    pub fn snapshot(&self) -> String {
        self.document.content().to_string()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.proxies.contains_key(id)
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.proxies.keys()
    }

    /// Register a client. Its replica must start from [`ProxyRegistry::snapshot`]
    /// taken without any request processed in between.
    pub fn add_proxy_client(&mut self, id: ClientId) -> OtResult<()> {
        if self.proxies.contains_key(&id) {
            return Err(OtError::DuplicateClient(id));
        }
        self.proxies.insert(id, Jupiter::new(Side::Server));
        log::debug!("proxy {id} added ({} clients)", self.proxies.len());
        Ok(())
    }

    /// Drop a client; the remaining proxies are untouched.
    pub fn remove_proxy_client(&mut self, id: &ClientId) -> bool {
        let removed = self.proxies.remove(id).is_some();
        if removed {
            log::debug!("proxy {id} removed ({} clients)", self.proxies.len());
        }
        removed
    }

    /// Process a request from `from` and produce one request per other client.
    ///
    /// On error nothing is fanned out and neither the document nor any proxy
    /// changes; a `requires_resync` error means the sender's link must be
    /// resynchronized with [`ProxyRegistry::resync`].
    pub fn receive(&mut self, from: &ClientId, request: &Request) -> OtResult<Vec<(ClientId, Request)>> {
        let proxy = self
            .proxies
            .get_mut(from)
            .ok_or(OtError::UnknownClient(*from))?;
        let mut staged = proxy.clone();
        let operation = staged.receive(request)?;
        self.document.apply(&operation)?;
        *proxy = staged;

        let fan_out = self
            .proxies
            .iter_mut()
            .filter(|(id, _)| *id != from)
            .map(|(id, proxy)| (*id, proxy.generate(operation.clone())))
            .collect();
        Ok(fan_out)
    }

    /// Record that `id` has incorporated `count` relayed operations.
    pub fn acknowledge(&mut self, id: &ClientId, count: u64) -> OtResult<()> {
        self.proxies
            .get_mut(id)
            .ok_or(OtError::UnknownClient(*id))?
            .acknowledge(count)
    }

    /// Number of operations `id` has sent that the relay incorporated.
    pub fn processed_count(&self, id: &ClientId) -> OtResult<u64> {
        self.proxies
            .get(id)
            .map(|proxy| proxy.timestamp().remote_count)
            .ok_or(OtError::UnknownClient(*id))
    }

    /// Checksum of the authoritative document, stamped for `id`'s link.
    pub fn checksum_for(&self, id: &ClientId) -> OtResult<StampedChecksum> {
        let proxy = self.proxies.get(id).ok_or(OtError::UnknownClient(*id))?;
        Ok(StampedChecksum {
            checksum: self.document.checksum(),
            timestamp: proxy.timestamp(),
        })
    }

    /// Restart `id`'s link from scratch and return the content it restarts from.
    pub fn resync(&mut self, id: &ClientId) -> OtResult<String> {
        self.proxies
            .get_mut(id)
            .ok_or(OtError::UnknownClient(*id))?
            .reset();
        log::info!("proxy {id} resynchronized at {}", self.document.checksum());
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jupiter::Timestamp;
    use crate::operation::Operation;

    #[test]
    fn test_add_remove() {
        let mut registry = ProxyRegistry::new("abc");
        let a = Uuid::new_v4();
        registry.add_proxy_client(a).unwrap();
        assert_eq!(registry.add_proxy_client(a), Err(OtError::DuplicateClient(a)));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_proxy_client(&a));
        assert!(!registry.remove_proxy_client(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fan_out_skips_sender() {
        let mut registry = ProxyRegistry::new("X");
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [a, b, c] {
            registry.add_proxy_client(id).unwrap();
        }
        let request = Request {
            operation: Operation::insert(0, "a"),
            timestamp: Timestamp::default(),
        };
        let out = registry.receive(&a, &request).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(id, _)| *id != a));
        assert!(out
            .iter()
            .all(|(_, r)| r.operation == Operation::insert(0, "a") && r.timestamp == Timestamp::default()));
        assert_eq!(registry.snapshot(), "aX");
        assert_eq!(registry.processed_count(&a), Ok(1));
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut registry = ProxyRegistry::new("");
        let ghost = Uuid::new_v4();
        let request = Request {
            operation: Operation::insert(0, "boo"),
            timestamp: Timestamp::default(),
        };
        assert_eq!(registry.receive(&ghost, &request), Err(OtError::UnknownClient(ghost)));
        assert_eq!(registry.snapshot(), "");
    }

    #[test]
    fn test_removed_client_not_in_fan_out() {
        let mut registry = ProxyRegistry::new("");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.add_proxy_client(a).unwrap();
        registry.add_proxy_client(b).unwrap();
        registry.remove_proxy_client(&b);
        let request = Request {
            operation: Operation::insert(0, "x"),
            timestamp: Timestamp::default(),
        };
        assert!(registry.receive(&a, &request).unwrap().is_empty());
    }

    #[test]
    fn test_rejected_split_changes_nothing() {
        let mut registry = ProxyRegistry::new("abc");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.add_proxy_client(a).unwrap();
        registry.add_proxy_client(b).unwrap();
        let before = registry.checksum_for(&b).unwrap();

        let broken = Request {
            operation: Operation::split(Operation::delete(0, "a"), Operation::delete(1, "zz")),
            timestamp: Timestamp::default(),
        };
        let err = registry.receive(&a, &broken).unwrap_err();
        assert!(err.requires_resync());
        assert_eq!(registry.snapshot(), "abc");
        assert_eq!(registry.checksum_for(&b).unwrap(), before);
        assert_eq!(registry.processed_count(&a), Ok(0));

        // The sender's link is still usable at the same timestamp.
        let valid = Request {
            operation: Operation::delete(0, "a"),
            timestamp: Timestamp::default(),
        };
        assert_eq!(registry.receive(&a, &valid).unwrap().len(), 1);
        assert_eq!(registry.snapshot(), "bc");
    }

    #[test]
    fn test_position_past_usize_rejected() {
        let mut registry = ProxyRegistry::new("abc");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.add_proxy_client(a).unwrap();
        registry.add_proxy_client(b).unwrap();
        // Give `a`'s proxy an outstanding insert to transform against.
        registry
            .receive(
                &b,
                &Request {
                    operation: Operation::insert(0, "z"),
                    timestamp: Timestamp::default(),
                },
            )
            .unwrap();

        let request = Request {
            operation: Operation::delete(usize::MAX, "x"),
            timestamp: Timestamp::default(),
        };
        assert!(matches!(
            registry.receive(&a, &request),
            Err(OtError::OutOfRange { position: usize::MAX, .. })
        ));
        assert_eq!(registry.snapshot(), "zabc");
        assert_eq!(registry.processed_count(&a), Ok(0));
    }

    #[test]
    fn test_checksum_and_resync() {
        let mut registry = ProxyRegistry::new("abc");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.add_proxy_client(a).unwrap();
        registry.add_proxy_client(b).unwrap();
        let request = Request {
            operation: Operation::delete(0, "a"),
            timestamp: Timestamp::default(),
        };
        registry.receive(&a, &request).unwrap();

        let for_b = registry.checksum_for(&b).unwrap();
        assert_eq!(for_b.timestamp, Timestamp::new(1, 0));
        let for_a = registry.checksum_for(&a).unwrap();
        assert_eq!(for_a.timestamp, Timestamp::new(0, 1));
        assert_eq!(for_a.checksum, for_b.checksum);

        assert_eq!(registry.resync(&b).unwrap(), "bc");
        assert_eq!(registry.checksum_for(&b).unwrap().timestamp, Timestamp::default());
    }
}
