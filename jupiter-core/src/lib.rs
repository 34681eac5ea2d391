//! # jupiter-core — operational transformation consistency engine
//!
//! Keeps replicas of a text document identical while every site edits
//! concurrently, using the Jupiter client/server protocol over a central
//! relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   Request    ┌─────────────────────────────┐
//! │ ClientReplica │ ───────────► │ ProxyRegistry               │
//! │  Document     │              │  Document (authoritative)   │
//! │  Jupiter      │ ◄─────────── │  Jupiter per client (proxy) │
//! │  (client)     │   Request    │  (server)                   │
//! └───────────────┘              └─────────────────────────────┘
//!         │                                   │
//!         └──────── transform / xform ────────┘
//!                   Operation algebra
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — Insert / Delete / Split / NoOp
//! - [`transform`] — inclusion and exclusion transformation
//! - [`document`] — text buffer operations are applied to
//! - [`jupiter`] — per-link state machine, timestamps, requests
//! - [`replica`] — client document + state machine
//! - [`proxy`] — server relay, one proxy per client
//! - [`checksum`] — divergence detection

pub mod checksum;
pub mod document;
pub mod error;
pub mod jupiter;
pub mod operation;
pub mod proxy;
pub mod replica;
pub mod transform;

pub use checksum::{Checksum, StampedChecksum};
pub use document::Document;
pub use error::{OtError, OtResult};
pub use jupiter::{Jupiter, Request, Side, Timestamp};
pub use operation::Operation;
pub use proxy::{ClientId, ProxyRegistry};
pub use replica::{ChecksumCheck, ClientReplica};
pub use transform::{transform, transform_exclude, xform, Tie};
