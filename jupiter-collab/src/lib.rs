//! # jupiter-collab — WebSocket relay and client for Jupiter sessions
//!
//! Carries the requests of the `jupiter-core` consistency engine between
//! client replicas and a central relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient    │ ◄────────────────► │ SyncServer       │
//! │ (per user)    │    Binary Proto    │ (central relay)  │
//! └──────┬────────┘                    └────────┬─────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌───────────────┐                    ┌──────────────────┐
//! │ ClientReplica │                    │ Session (doc_id) │
//! │ (local)       │                    │ ProxyRegistry    │
//! └───────────────┘                    │ (authority)      │
//!                                      └────────┬─────────┘
//!                                               │
//!                                      ┌────────┴─────────┐
//!                                      │ per-peer queues  │
//!                                      │ (fan-out)        │
//!                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`] — Per-document proxy registry with per-peer fan-out
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket client driving a local replica

pub mod protocol;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use session::{Outbound, Session, SessionError, SessionManager, SessionStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
