//! # cowrite — Realtime collaborative document hub
//!
//! WebSocket-based multiplayer editing for rich-text documents using CRDT
//! synchronization (Yrs). The hub authenticates every socket, multiplexes
//! sessions into per-document rooms, keeps an authoritative replica per
//! active document, enforces role-based edit permissions, and persists
//! periodic snapshots to the metadata store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket       ┌──────────────┐
//! │ DocProvider  │ ◄──────────────────► │ CollabHub    │
//! │ (per client) │    JSON envelopes    │ (central)    │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ Yrs Doc      │                      │ Yrs Doc      │
//! │ (local)      │                      │ (authority)  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!                                 ┌────────────┼────────────┐
//!                                 ▼            ▼            ▼
//!                          RoomRegistry  ReplicaRegistry  MetadataStore
//!                          (presence)    (lifecycle)      (snapshots)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope (tagged client/server messages)
//! - [`auth`] — bearer-token authentication at the socket handshake
//! - [`access`] — per-document role resolution and the capability matrix
//! - [`store`] — the external metadata store interface
//! - [`replica`] — authoritative replica lifecycle (acquire/touch/retire)
//! - [`snapshot`] — snapshot load/save with per-document coalescing
//! - [`rooms`] — room membership, presence, fan-out targets
//! - [`hub`] — the WebSocket hub server and per-session dispatcher
//! - [`sync`] — state-vector diff encoding for reconnect resync
//! - [`provider`] — client-side bridge between a local doc and the hub

pub mod access;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod provider;
pub mod replica;
pub mod rooms;
pub mod snapshot;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use access::Role;
pub use auth::{AuthError, AuthGate, Identity};
pub use config::HubConfig;
pub use error::HubError;
pub use hub::{CollabHub, HubStats};
pub use protocol::{ClientMessage, PeerIdentity, ProtocolError, ServerMessage};
pub use provider::{DocProvider, ProviderEvent};
pub use replica::ReplicaRegistry;
pub use rooms::{RoomRegistry, Subscriber};
pub use store::{
    Collaborator, DocumentRecord, MemoryStore, MetadataStore, StoreError, User,
};
