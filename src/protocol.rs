//! JSON wire protocol between the provider and the hub.
//!
//! Envelope format: every message is one WebSocket text frame carrying a
//! JSON object with a `type` tag and camelCase fields. Binary CRDT and
//! awareness payloads ride inside the envelope as arrays of byte values —
//! the encoding of the reference transport. The hub advertises the choice
//! on the upgrade response via the `x-cowrite-proto: json-v1` header.
//!
//! ```text
//! client ── {"type":"join-document","documentId":"…"} ──────────► hub
//! client ◄─ {"type":"yjs-sync","documentId":"…","update":[…]} ── hub
//! client ◄─ {"type":"join-ack","success":true,"users":[…]} ───── hub
//! client ── {"type":"yjs-update","documentId":"…","update":[…]}► hub
//! peer   ◄─ {"type":"yjs-update","update":[…],"userId":"…"} ──── hub
//! ```
//!
//! Update and awareness payloads are opaque to the envelope: the hub never
//! inspects awareness bytes, and update bytes are only decoded at the
//! authoritative replica.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the upgrade-response header advertising the wire encoding.
pub const PROTO_HEADER: &str = "x-cowrite-proto";

/// The envelope encoding this implementation speaks.
pub const PROTO_VERSION: &str = "json-v1";

/// Maximum accepted length of a document id on the wire.
pub const MAX_DOCUMENT_ID_LEN: usize = 64;

/// Identity tuple of a room subscriber, as carried in acks and presence
/// broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub role: crate::access::Role,
}

/// Messages sent by the client to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a document. The hub replies with `yjs-sync` (full
    /// state) followed by `join-ack`.
    #[serde(rename_all = "camelCase")]
    JoinDocument { document_id: String },

    /// Re-subscribe after a transient disconnect, reporting the local
    /// state vector. The hub replies with `yjs-sync` carrying only the
    /// missing updates, followed by `join-ack`.
    #[serde(rename_all = "camelCase")]
    RejoinDocument {
        document_id: String,
        state_vector: Vec<u8>,
    },

    /// Unsubscribe from a document. No ack; unknown subscriptions are
    /// silently ignored.
    #[serde(rename_all = "camelCase")]
    LeaveDocument { document_id: String },

    /// A (possibly coalesced) CRDT update produced locally.
    #[serde(rename_all = "camelCase")]
    YjsUpdate {
        document_id: String,
        update: Vec<u8>,
    },

    /// An awareness delta (cursor/selection presence). Opaque to the hub.
    #[serde(rename_all = "camelCase")]
    YjsAwareness {
        document_id: String,
        update: Vec<u8>,
    },
}

impl ClientMessage {
    /// The document this message addresses.
    pub fn document_id(&self) -> &str {
        match self {
            ClientMessage::JoinDocument { document_id }
            | ClientMessage::RejoinDocument { document_id, .. }
            | ClientMessage::LeaveDocument { document_id }
            | ClientMessage::YjsUpdate { document_id, .. }
            | ClientMessage::YjsAwareness { document_id, .. } => document_id,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialize(e.to_string()))
    }
}

/// Messages sent by the hub to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to `join-document` / `rejoin-document`. On success `users`
    /// holds the full subscriber list observed at join time, including the
    /// joiner; on failure `error` holds a display string.
    #[serde(rename_all = "camelCase")]
    JoinAck {
        document_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        users: Option<Vec<PeerIdentity>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Full or incremental document state, always directed at one session
    /// and always delivered before the corresponding `join-ack`.
    #[serde(rename_all = "camelCase")]
    YjsSync {
        document_id: String,
        update: Vec<u8>,
    },

    /// A peer's CRDT update, relayed after the authoritative replica
    /// absorbed it.
    #[serde(rename_all = "camelCase")]
    YjsUpdate {
        document_id: String,
        update: Vec<u8>,
        user_id: String,
    },

    /// A peer's awareness delta, relayed verbatim.
    #[serde(rename_all = "camelCase")]
    YjsAwareness {
        document_id: String,
        update: Vec<u8>,
        user_id: String,
    },

    /// Broadcast to existing subscribers when a session joins the room.
    #[serde(rename_all = "camelCase")]
    UserJoined {
        document_id: String,
        user_id: String,
        display_name: String,
        email: String,
    },

    /// Broadcast to remaining subscribers when a session leaves the room.
    #[serde(rename_all = "camelCase")]
    UserLeft {
        document_id: String,
        user_id: String,
        display_name: String,
        email: String,
    },

    /// Directed at a session whose mutation was rejected by the role
    /// check. The update was neither applied nor relayed.
    #[serde(rename_all = "camelCase")]
    PermissionDenied {
        document_id: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialize(e.to_string()))
    }

    /// Build a successful join ack.
    pub fn join_ok(document_id: impl Into<String>, users: Vec<PeerIdentity>) -> Self {
        ServerMessage::JoinAck {
            document_id: document_id.into(),
            success: true,
            users: Some(users),
            error: None,
        }
    }

    /// Build a failed join ack.
    pub fn join_err(document_id: impl Into<String>, error: impl Into<String>) -> Self {
        ServerMessage::JoinAck {
            document_id: document_id.into(),
            success: false,
            users: None,
            error: Some(error.into()),
        }
    }
}

/// Validate a wire-supplied document id: non-empty, bounded length, no
/// control characters. Returns the id unchanged on success.
pub fn validate_document_id(id: &str) -> Result<&str, ProtocolError> {
    if id.is_empty() || id.len() > MAX_DOCUMENT_ID_LEN {
        return Err(ProtocolError::InvalidDocumentId(id.to_string()));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(ProtocolError::InvalidDocumentId(id.to_string()));
    }
    Ok(id)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("deserialize error: {0}")]
    Deserialize(String),
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),
    #[error("connection closed")]
    ConnectionClosed,
}
