//! Per-document sessions: one proxy registry plus per-peer outbound queues.
//!
//! Unlike a plain broadcast, every peer receives its own request: each proxy
//! stamps the relayed operation with the timestamp of its link. The session
//! mutex is the serialization point for a document; requests from different
//! connections are processed one at a time, in arrival order.
//!
//! ```text
//!            ┌──────────── Session (doc_id) ─────────────┐
//! peer A ───►│ relay ─► ProxyRegistry ─► (B, req) ─► tx B │───► peer B
//!            │                        └─► (C, req) ─► tx C │───► peer C
//!            │         Ack(count) ──────────────────► tx A │───► peer A
//!            └───────────────────────────────────────────┘
//! ```
//!
//! Outbound queues are bounded. A peer whose queue overflows has missed a
//! request, so it is marked lagged and must resynchronize before it may send
//! again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jupiter_core::{OtError, ProxyRegistry, Request};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Encoded messages waiting to be written to one peer's socket.
pub type Outbound = mpsc::Receiver<Arc<Vec<u8>>>;

/// Statistics for monitoring session health.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub resyncs: u64,
    pub active_peers: usize,
}

/// Counters updated while the session lock is held but read without it.
struct AtomicSessionStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    resyncs: AtomicU64,
}

impl AtomicSessionStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        }
    }
}

/// Session-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {doc_id} is full ({max_peers} peers)")]
    Full { doc_id: Uuid, max_peers: usize },
    #[error("peer {0} missed relayed requests and must resynchronize")]
    Lagged(Uuid),
    /// The session was removed from its manager after its last peer left.
    #[error("session {0} is closed")]
    Closed(Uuid),
    #[error(transparent)]
    Engine(#[from] OtError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether the peer's link is broken and has to be resynchronized.
    pub fn requires_resync(&self) -> bool {
        match self {
            Self::Lagged(_) => true,
            Self::Engine(err) => err.requires_resync(),
            _ => false,
        }
    }
}

struct PeerSlot {
    info: PeerInfo,
    tx: mpsc::Sender<Arc<Vec<u8>>>,
    lagged: bool,
}

struct SessionState {
    registry: ProxyRegistry,
    peers: BTreeMap<Uuid, PeerSlot>,
    closed: bool,
}

/// A document session shared by every connection editing that document.
pub struct Session {
    doc_id: Uuid,
    state: Mutex<SessionState>,
    max_peers: usize,
    /// Outbound queue capacity per peer
    capacity: usize,
    atomic_stats: AtomicSessionStats,
}

impl Session {
    /// Create an empty session for `doc_id`.
    pub fn new(doc_id: Uuid, content: impl Into<String>, max_peers: usize, capacity: usize) -> Self {
        Self {
            doc_id,
            state: Mutex::new(SessionState {
                registry: ProxyRegistry::new(content),
                peers: BTreeMap::new(),
                closed: false,
            }),
            max_peers,
            capacity: capacity.max(1),
            atomic_stats: AtomicSessionStats::new(),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Register a peer and return its outbound queue.
    ///
    /// The queue starts with a snapshot of the authoritative document,
    /// followed by one `PeerJoined` per peer already present. Taking the
    /// snapshot and registering the proxy happen under the same lock, so the
    /// new replica and its proxy start from the same state.
    ///
    /// Fails with [`SessionError::Closed`] once the session has been dropped
    /// by its manager; join through [`SessionManager::join`] to get the
    /// current session for the document instead.
    pub async fn join(&self, info: PeerInfo) -> Result<Outbound, SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed(self.doc_id));
        }
        if state.peers.len() >= self.max_peers {
            return Err(SessionError::Full {
                doc_id: self.doc_id,
                max_peers: self.max_peers,
            });
        }
        let snapshot = SyncMessage::snapshot(self.doc_id, &state.registry.snapshot())?.encode()?;
        let joined = Arc::new(SyncMessage::peer_joined(self.doc_id, &info)?.encode()?);
        state.registry.add_proxy_client(info.peer_id)?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let peer_id = info.peer_id;
        state.peers.insert(
            peer_id,
            PeerSlot {
                info,
                tx,
                lagged: false,
            },
        );

        self.deliver(&mut state, &peer_id, Arc::new(snapshot));
        let present: Vec<PeerInfo> = state
            .peers
            .values()
            .filter(|slot| slot.info.peer_id != peer_id)
            .map(|slot| slot.info.clone())
            .collect();
        for other in present {
            let notice = SyncMessage::peer_joined(self.doc_id, &other)?.encode()?;
            self.deliver(&mut state, &peer_id, Arc::new(notice));
            self.deliver(&mut state, &other.peer_id, joined.clone());
        }
        Ok(rx)
    }

    /// Drop a peer and tell the others. Returns the number of peers left.
    pub async fn leave(&self, peer_id: &Uuid) -> usize {
        let mut state = self.state.lock().await;
        state.registry.remove_proxy_client(peer_id);
        if state.peers.remove(peer_id).is_some() {
            match SyncMessage::peer_left(*peer_id, self.doc_id).encode() {
                Ok(encoded) => {
                    let notice = Arc::new(encoded);
                    let others: Vec<Uuid> = state.peers.keys().copied().collect();
                    for other in others {
                        self.deliver(&mut state, &other, notice.clone());
                    }
                }
                Err(e) => log::error!("Failed to encode PeerLeft for {peer_id}: {e}"),
            }
        }
        state.peers.len()
    }

    /// Process a request from `from`, relay it to every other peer and
    /// acknowledge it to the sender. Returns the number of peers relayed to.
    pub async fn relay(&self, from: &Uuid, request: &Request) -> Result<usize, SessionError> {
        let mut state = self.state.lock().await;
        if state.peers.get(from).is_some_and(|slot| slot.lagged) {
            return Err(SessionError::Lagged(*from));
        }

        let fan_out = state.registry.receive(from, request)?;
        let relayed = fan_out.len();
        for (to, outgoing) in fan_out {
            let encoded = SyncMessage::request(*from, self.doc_id, &outgoing)?.encode()?;
            self.deliver(&mut state, &to, Arc::new(encoded));
        }

        let processed = state.registry.processed_count(from)?;
        let ack = SyncMessage::ack(Uuid::nil(), self.doc_id, processed)?.encode()?;
        self.deliver(&mut state, from, Arc::new(ack));
        Ok(relayed)
    }

    /// Record that `peer_id` has incorporated `count` relayed requests.
    pub async fn acknowledge(&self, peer_id: &Uuid, count: u64) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.registry.acknowledge(peer_id, count)?;
        Ok(())
    }

    /// Queue a checksum of the authoritative document, stamped for `peer_id`.
    pub async fn send_checksum(&self, peer_id: &Uuid) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.peers.get(peer_id).is_some_and(|slot| slot.lagged) {
            return Err(SessionError::Lagged(*peer_id));
        }
        let stamped = state.registry.checksum_for(peer_id)?;
        let encoded = SyncMessage::checksum(self.doc_id, &stamped)?.encode()?;
        self.deliver(&mut state, peer_id, Arc::new(encoded));
        Ok(())
    }

    /// Restart `peer_id`'s link from the authoritative document.
    ///
    /// Returns a fresh outbound queue whose first message is the snapshot.
    /// Whatever was still queued on the old one describes the abandoned link
    /// and is dropped with it.
    pub async fn resync(&self, peer_id: &Uuid) -> Result<Outbound, SessionError> {
        let mut state = self.state.lock().await;
        let content = state.registry.resync(peer_id)?;
        let snapshot = SyncMessage::snapshot(self.doc_id, &content)?.encode()?;

        let (tx, rx) = mpsc::channel(self.capacity);
        if let Some(slot) = state.peers.get_mut(peer_id) {
            slot.tx = tx;
            slot.lagged = false;
        }
        self.deliver(&mut state, peer_id, Arc::new(snapshot));
        self.atomic_stats.resyncs.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    /// Current authoritative content.
    pub async fn snapshot(&self) -> String {
        self.state.lock().await.registry.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let state = self.state.lock().await;
        state.peers.values().map(|slot| slot.info.clone()).collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.state.lock().await.peers.contains_key(peer_id)
    }

    pub async fn stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        SessionStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            resyncs: self.atomic_stats.resyncs.load(Ordering::Relaxed),
            active_peers: state.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Refuse further joins if nobody is connected. Returns whether the
    /// session is now closed.
    async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.peers.is_empty() {
            state.closed = true;
        }
        state.closed
    }

    /// Queue `bytes` for `to` without waiting.
    ///
    /// Never blocks: the sender's task may hold the lock another connection
    /// needs before it can drain its own queue.
    fn deliver(&self, state: &mut SessionState, to: &Uuid, bytes: Arc<Vec<u8>>) {
        let Some(slot) = state.peers.get_mut(to) else {
            return;
        };
        if slot.lagged {
            self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match slot.tx.try_send(bytes) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Peer {to} lagged behind in doc {}, resync required", self.doc_id);
                slot.lagged = true;
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Peer {to} outbound queue closed");
            }
        }
    }
}

/// Session manager: maps document IDs to sessions.
///
/// Sessions are isolated from each other and run concurrently.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    max_peers: usize,
    capacity: usize,
}

impl SessionManager {
    pub fn new(max_peers: usize, capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_peers,
            capacity,
        }
    }

    /// Get or create the session for the given document.
    ///
    /// New sessions start from an empty document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&doc_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(&doc_id) {
            return session.clone();
        }

        let session = Arc::new(Session::new(doc_id, "", self.max_peers, self.capacity));
        sessions.insert(doc_id, session.clone());
        log::info!("Session {doc_id} created");
        session
    }

    /// Join the current session for `doc_id`, creating it if needed.
    ///
    /// A session found in the map may be closed by a concurrent
    /// [`SessionManager::remove_if_empty`] before the join takes its lock;
    /// the join is then retried against the replacement session.
    pub async fn join(&self, doc_id: Uuid, info: PeerInfo) -> Result<(Arc<Session>, Outbound), SessionError> {
        loop {
            let session = self.get_or_create(doc_id).await;
            match session.join(info.clone()).await {
                Ok(outbound) => return Ok((session, outbound)),
                Err(SessionError::Closed(_)) => {
                    log::debug!("Session {doc_id} closed while joining, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(doc_id).cloned()
    }

    /// Remove a session once its last peer has left.
    ///
    /// The session is closed under its own lock while the map is write
    /// locked, so no join can land in it after it leaves the map.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(doc_id) {
            if session.close_if_empty().await {
                sessions.remove(doc_id);
                log::info!("Session {doc_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
