//! WebSocket relay server with per-document sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (doc_id) ── ProxyRegistry ── authoritative Document
//! Client B ──┘          │
//!                       ├── proxy A ── outbound queue A ──► Client A
//!                       └── proxy B ── outbound queue B ──► Client B
//! ```
//!
//! Each connection task reads its socket in order, so requests from one
//! client reach the session in the order they were generated. The session
//! lock orders requests across clients.
//!
//! A broken link is never repaired in place. When a request from a client
//! cannot be incorporated, the relay sends `ResyncRequired`, ignores that
//! client's requests until it answers with `ResyncRequest`, then restarts the
//! link from a fresh snapshot. `ResyncRequired` is written straight to the
//! socket, not through the peer's queue: a lagged peer's queue is full. The
//! client discards queued link traffic from then until the snapshot arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::session::{Outbound, Session, SessionManager};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per document session
    pub max_peers_per_session: usize,
    /// Outbound queue capacity per peer
    pub channel_capacity: usize,
    /// Interval between checksum broadcasts; 0 disables the watchdog
    pub checksum_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_session: 100,
            channel_capacity: 1024,
            checksum_interval_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `JUPITER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Override fields from environment variables that are set and parse.
    pub fn merge_with_env(mut self) -> Self {
        if let Ok(addr) = std::env::var("JUPITER_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(max) = env_parse("JUPITER_MAX_PEERS") {
            self.max_peers_per_session = max;
        }
        if let Some(capacity) = env_parse("JUPITER_CHANNEL_CAPACITY") {
            self.channel_capacity = capacity;
        }
        if let Some(interval) = env_parse("JUPITER_CHECKSUM_INTERVAL_MS") {
            self.checksum_interval_ms = interval;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub resyncs: u64,
}

/// Per-connection protocol state.
struct Connection {
    peer_id: Option<Uuid>,
    session: Option<Arc<Session>>,
    outbound: Option<Outbound>,
    /// Set after a failed request; cleared by the client's `ResyncRequest`.
    awaiting_resync: bool,
}

impl Connection {
    fn new() -> Self {
        Self {
            peer_id: None,
            session: None,
            outbound: None,
            awaiting_resync: false,
        }
    }

    fn joined(&self) -> Option<(Uuid, Arc<Session>)> {
        match (self.peer_id, &self.session) {
            (Some(peer_id), Some(session)) => Some((peer_id, session.clone())),
            _ => None,
        }
    }
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.max_peers_per_session,
            config.channel_capacity,
        ));
        Self {
            config,
            sessions,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Jupiter relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sessions, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new();
        let mut watchdog = checksum_interval(config.checksum_interval_ms);

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(sync_msg) => sync_msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::Join => {
                                        if conn.peer_id.is_some() {
                                            log::warn!("Duplicate join from {addr} ignored");
                                            continue;
                                        }
                                        let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                            PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
                                        });
                                        match sessions.join(sync_msg.doc_id, info.clone()).await {
                                            Ok((session, outbound)) => {
                                                log::info!(
                                                    "Peer {} ({}) joined doc {}",
                                                    info.name,
                                                    info.peer_id,
                                                    sync_msg.doc_id
                                                );
                                                conn.peer_id = Some(info.peer_id);
                                                conn.session = Some(session);
                                                conn.outbound = Some(outbound);
                                                let mut s = stats.write().await;
                                                s.active_sessions = sessions.session_count().await;
                                            }
                                            Err(e) => {
                                                log::warn!("Peer {} refused from doc {}: {e}", info.peer_id, sync_msg.doc_id);
                                                sessions.remove_if_empty(&sync_msg.doc_id).await;
                                                break;
                                            }
                                        }
                                    }

                                    MessageType::Request => {
                                        let Some((peer_id, session)) = conn.joined() else {
                                            log::debug!("Request from {addr} before join");
                                            continue;
                                        };
                                        if conn.awaiting_resync {
                                            log::debug!("Dropping request from {peer_id} awaiting resync");
                                            continue;
                                        }
                                        let request = match sync_msg.jupiter_request() {
                                            Ok(request) => request,
                                            Err(e) => {
                                                log::warn!("Malformed request from {peer_id}: {e}");
                                                continue;
                                            }
                                        };
                                        match session.relay(&peer_id, &request).await {
                                            Ok(relayed) => {
                                                log::trace!("Relayed {} from {peer_id} to {relayed} peers", request.operation);
                                            }
                                            Err(e) if e.requires_resync() => {
                                                log::warn!("Link to {peer_id} broken: {e}");
                                                conn.awaiting_resync = true;
                                                let notice = SyncMessage::resync_required(session.doc_id());
                                                ws_sender.send(Message::Binary(notice.encode()?.into())).await?;
                                            }
                                            Err(e) => log::warn!("Request from {peer_id} rejected: {e}"),
                                        }
                                    }

                                    MessageType::Ack => {
                                        let Some((peer_id, session)) = conn.joined() else {
                                            continue;
                                        };
                                        if conn.awaiting_resync {
                                            continue;
                                        }
                                        let count = match sync_msg.ack_count() {
                                            Ok(count) => count,
                                            Err(e) => {
                                                log::warn!("Malformed ack from {peer_id}: {e}");
                                                continue;
                                            }
                                        };
                                        if let Err(e) = session.acknowledge(&peer_id, count).await {
                                            if e.requires_resync() {
                                                log::warn!("Link to {peer_id} broken: {e}");
                                                conn.awaiting_resync = true;
                                                let notice = SyncMessage::resync_required(session.doc_id());
                                                ws_sender.send(Message::Binary(notice.encode()?.into())).await?;
                                            } else {
                                                log::warn!("Ack from {peer_id} rejected: {e}");
                                            }
                                        }
                                    }

                                    MessageType::ResyncRequest => {
                                        let Some((peer_id, session)) = conn.joined() else {
                                            continue;
                                        };
                                        // Replacing the queue drops whatever was
                                        // generated for the abandoned link.
                                        conn.outbound = Some(session.resync(&peer_id).await?);
                                        conn.awaiting_resync = false;
                                        stats.write().await.resyncs += 1;
                                        log::info!("Peer {peer_id} resynchronized in doc {}", session.doc_id());
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(conn.peer_id.unwrap_or(sync_msg.peer_id));
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    _ => {
                                        log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing messages queued by the session
                    data = async {
                        match conn.outbound.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not joined yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match data {
                            Some(data) => {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            None => break,
                        }
                    }

                    // Consistency watchdog
                    _ = async {
                        match watchdog.as_mut() {
                            Some(interval) => interval.tick().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some((peer_id, session)) = conn.joined() else {
                            continue;
                        };
                        if conn.awaiting_resync {
                            continue;
                        }
                        match session.send_checksum(&peer_id).await {
                            Ok(()) => {}
                            Err(e) if e.requires_resync() => {
                                log::warn!("Link to {peer_id} broken: {e}");
                                conn.awaiting_resync = true;
                                let notice = SyncMessage::resync_required(session.doc_id());
                                ws_sender.send(Message::Binary(notice.encode()?.into())).await?;
                            }
                            Err(e) => log::warn!("Checksum for {peer_id} failed: {e}"),
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup: remove peer from its session
        if let Some((peer_id, session)) = conn.joined() {
            let remaining = session.leave(&peer_id).await;
            log::info!("Peer {peer_id} left doc {} ({remaining} remaining)", session.doc_id());
            if remaining == 0 {
                sessions.remove_if_empty(&session.doc_id()).await;
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = sessions.session_count().await;
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get session manager reference.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

/// First tick after one full period, not immediately.
fn checksum_interval(interval_ms: u64) -> Option<Interval> {
    if interval_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(interval_ms);
    Some(tokio::time::interval_at(Instant::now() + period, period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_session, 100);
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.checksum_interval_ms, 5_000);
    }

    #[test]
    fn test_server_config_from_env() {
        std::env::set_var("JUPITER_BIND_ADDR", "0.0.0.0:7000");
        std::env::set_var("JUPITER_MAX_PEERS", "12");
        std::env::set_var("JUPITER_CHECKSUM_INTERVAL_MS", "not-a-number");
        let config = ServerConfig::from_env();
        std::env::remove_var("JUPITER_BIND_ADDR");
        std::env::remove_var("JUPITER_MAX_PEERS");
        std::env::remove_var("JUPITER_CHECKSUM_INTERVAL_MS");

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_session, 12);
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.checksum_interval_ms, 5_000);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_session: 50,
            channel_capacity: 512,
            checksum_interval_ms: 0,
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.config().channel_capacity, 512);
    }

    #[test]
    fn test_watchdog_disabled_at_zero() {
        assert!(checksum_interval(0).is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.resyncs, 0);
        assert_eq!(server.sessions().session_count().await, 0);
    }
}
