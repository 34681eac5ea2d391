//! WebSocket client for editing a document through the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Local edits applied immediately and stamped for the relay
//! - Remote requests transformed and applied as they arrive
//! - Checksum verification and resynchronization on divergence
//!
//! Everything sent to the relay is queued while the replica lock is held,
//! so requests and acknowledgments leave in the order the replica produced
//! them.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use jupiter_core::{ChecksumCheck, ClientReplica, Operation, Timestamp};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial snapshot received; edits are accepted from now on
    Synced(String),
    /// A remote operation was applied to the local document
    RemoteOperation(Operation),
    /// The local replica diverged; edits are refused until resynchronized
    Resynchronizing,
    /// The replica restarted from an authoritative snapshot
    Resynchronized(String),
    /// A peer joined the document
    PeerJoined(PeerInfo),
    /// A peer left the document
    PeerLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,

    /// Document we're editing
    doc_id: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local document and the client end of the link
    replica: Arc<Mutex<ClientReplica>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(peer_info: PeerInfo, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let mut replica = ClientReplica::new("");
        // Nothing may be edited before the first snapshot arrives.
        replica.begin_resync();
        Self {
            peer_info,
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(Mutex::new(replica)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        // Writer task: forward outgoing channel to WebSocket, close when the
        // client drops its sender.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        self.replica.lock().await.begin_resync();
        let join_msg = SyncMessage::join(self.doc_id, &self.peer_info)?;
        out_tx
            .send(join_msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let reader = Reader {
            peer_id: self.peer_info.peer_id,
            doc_id: self.doc_id,
            replica: self.replica.clone(),
            out_tx: out_tx.downgrade(),
            event_tx: self.event_tx.clone(),
            synced: false,
        };
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if let Err(e) = reader.handle(sync_msg).await {
                                    log::warn!("Failed to handle relay message: {e}");
                                }
                            }
                            Err(e) => log::warn!("Failed to decode relay message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Apply a local edit and send it to the relay.
    ///
    /// Refused while disconnected and while the replica waits for a
    /// snapshot; the document is left untouched in both cases.
    pub async fn edit(&self, operation: Operation) -> Result<(), ProtocolError> {
        let tx = match (&self.outgoing_tx, *self.state.read().await) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => return Err(ProtocolError::ConnectionClosed),
        };

        let mut replica = self.replica.lock().await;
        let request = replica.edit(operation)?;
        let msg = SyncMessage::request(self.peer_info.peer_id, self.doc_id, &request)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.peer_info.peer_id);
        let encoded = msg.encode()?;

        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Close the connection. The writer task sends a close frame once the
    /// queued messages are flushed.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Current content of the local document.
    pub async fn content(&self) -> String {
        self.replica.lock().await.content().to_string()
    }

    /// Current timestamp of the client end of the link.
    pub async fn timestamp(&self) -> Timestamp {
        self.replica.lock().await.timestamp()
    }

    /// Whether edits are currently refused pending a snapshot.
    pub async fn is_resyncing(&self) -> bool {
        self.replica.lock().await.is_resyncing()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// State owned by the reader task.
///
/// Holds only a weak handle on the outgoing queue so that dropping the
/// client's sender is enough to close the connection.
struct Reader {
    peer_id: Uuid,
    doc_id: Uuid,
    replica: Arc<Mutex<ClientReplica>>,
    out_tx: mpsc::WeakSender<Vec<u8>>,
    event_tx: mpsc::Sender<SyncEvent>,
    synced: bool,
}

impl Reader {
    async fn handle(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        match msg.msg_type {
            MessageType::Snapshot => {
                let content = msg.snapshot_content()?;
                self.replica.lock().await.resync(content.clone());
                let event = if self.synced {
                    log::info!("Resynchronized doc {} ({} chars)", self.doc_id, content.chars().count());
                    SyncEvent::Resynchronized(content)
                } else {
                    self.synced = true;
                    SyncEvent::Synced(content)
                };
                self.emit(event).await;
            }

            MessageType::Request => {
                let request = msg.jupiter_request()?;
                let mut replica = self.replica.lock().await;
                let received = replica.receive(&request);
                match received {
                    Ok(operation) if operation.is_noop() => {}
                    Ok(operation) => {
                        drop(replica);
                        self.emit(SyncEvent::RemoteOperation(operation)).await;
                    }
                    Err(e) => {
                        log::warn!("Remote request rejected: {e}");
                        self.request_resync(&mut replica).await?;
                    }
                }
            }

            MessageType::Ack => {
                let count = msg.ack_count()?;
                let mut replica = self.replica.lock().await;
                if let Err(e) = replica.acknowledge(count) {
                    log::warn!("Acknowledgment rejected: {e}");
                    self.request_resync(&mut replica).await?;
                }
            }

            MessageType::Checksum => {
                let stamped = msg.stamped_checksum()?;
                let mut replica = self.replica.lock().await;
                match replica.verify(&stamped) {
                    ChecksumCheck::Consistent => {
                        let count = replica.timestamp().remote_count;
                        let ack = SyncMessage::ack(self.peer_id, self.doc_id, count)?;
                        self.send(ack.encode()?).await?;
                    }
                    ChecksumCheck::Diverged => self.request_resync(&mut replica).await?,
                    ChecksumCheck::Skipped => {}
                }
            }

            MessageType::ResyncRequired => {
                let mut replica = self.replica.lock().await;
                // Already waiting for the snapshot our own request will bring.
                if !replica.is_resyncing() {
                    self.request_resync(&mut replica).await?;
                }
            }

            MessageType::PeerJoined => {
                if let Ok(info) = msg.peer_info() {
                    self.emit(SyncEvent::PeerJoined(info)).await;
                }
            }

            MessageType::PeerLeft => self.emit(SyncEvent::PeerLeft(msg.peer_id)).await,

            MessageType::Pong => log::trace!("Pong from relay"),

            other => log::debug!("Unexpected message type from relay: {other:?}"),
        }
        Ok(())
    }

    /// Stop editing and ask the relay for a fresh snapshot.
    async fn request_resync(&self, replica: &mut ClientReplica) -> Result<(), ProtocolError> {
        replica.begin_resync();
        self.send(SyncMessage::resync_request(self.peer_id, self.doc_id).encode()?)
            .await?;
        self.emit(SyncEvent::Resynchronizing).await;
        Ok(())
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.out_tx
            .upgrade()
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let info = PeerInfo::new("TestUser");
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(info.clone(), doc_id, "ws://localhost:9090");

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let info = PeerInfo::new("TestUser");
        let client = SyncClient::new(info, Uuid::new_v4(), "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.timestamp().await, Timestamp::default());
        assert_eq!(client.content().await, "");
        assert!(client.is_resyncing().await);
    }

    #[tokio::test]
    async fn test_edit_offline_refused() {
        let info = PeerInfo::new("TestUser");
        let client = SyncClient::new(info, Uuid::new_v4(), "ws://localhost:9090");

        let err = client.edit(Operation::insert(0, "x")).await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
        assert_eq!(client.content().await, "");
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let info = PeerInfo::new("TestUser");
        let mut client = SyncClient::new(info, Uuid::new_v4(), "ws://localhost:9090");

        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    type Harness = (
        Reader,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Vec<u8>>,
        mpsc::Receiver<SyncEvent>,
    );

    fn reader() -> Harness {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let mut replica = ClientReplica::new("");
        replica.begin_resync();
        let reader = Reader {
            peer_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            replica: Arc::new(Mutex::new(replica)),
            out_tx: out_tx.downgrade(),
            event_tx,
            synced: false,
        };
        (reader, out_tx, out_rx, event_rx)
    }

    #[tokio::test]
    async fn test_reader_first_snapshot_then_resync() {
        let (mut reader, _tx, _out, mut events) = reader();
        let doc_id = reader.doc_id;
        reader.handle(SyncMessage::snapshot(doc_id, "abc").unwrap()).await.unwrap();
        assert_eq!(events.recv().await, Some(SyncEvent::Synced("abc".into())));
        assert!(!reader.replica.lock().await.is_resyncing());

        reader.handle(SyncMessage::snapshot(doc_id, "xyz").unwrap()).await.unwrap();
        assert_eq!(events.recv().await, Some(SyncEvent::Resynchronized("xyz".into())));
    }

    #[tokio::test]
    async fn test_reader_bad_request_asks_for_resync() {
        let (mut reader, _tx, mut out, mut events) = reader();
        let doc_id = reader.doc_id;
        reader.handle(SyncMessage::snapshot(doc_id, "abc").unwrap()).await.unwrap();
        events.recv().await;

        let bogus = jupiter_core::Request {
            operation: Operation::insert(0, "x"),
            timestamp: Timestamp::new(2, 0),
        };
        let msg = SyncMessage::request(Uuid::new_v4(), doc_id, &bogus).unwrap();
        reader.handle(msg).await.unwrap();

        assert_eq!(events.recv().await, Some(SyncEvent::Resynchronizing));
        let sent = SyncMessage::decode(&out.recv().await.unwrap()).unwrap();
        assert_eq!(sent.msg_type, MessageType::ResyncRequest);

        // A second notice while waiting does not ask again.
        reader.handle(SyncMessage::resync_required(doc_id)).await.unwrap();
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reader_consistent_checksum_acks() {
        let (mut reader, _tx, mut out, mut events) = reader();
        let doc_id = reader.doc_id;
        reader.handle(SyncMessage::snapshot(doc_id, "abc").unwrap()).await.unwrap();
        events.recv().await;

        let stamped = jupiter_core::StampedChecksum {
            checksum: jupiter_core::Checksum::of("abc"),
            timestamp: Timestamp::default(),
        };
        reader.handle(SyncMessage::checksum(doc_id, &stamped).unwrap()).await.unwrap();
        let sent = SyncMessage::decode(&out.recv().await.unwrap()).unwrap();
        assert_eq!(sent.ack_count().unwrap(), 0);
    }
}
