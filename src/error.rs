//! Crate-level error taxonomy.
//!
//! These are the failures that end (or refuse) a session or the server
//! loop itself. Authorization and validation rejections are not errors at
//! this level: the dispatcher reports them to the originating session as
//! protocol messages (failed acks, directed `permission-denied`) and the
//! connection stays up. Store failures surface as logs and retries, never
//! as client-visible errors; transport failures tear the session down.

use thiserror::Error;

use crate::auth::AuthError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Top-level hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("websocket error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HubError::Transport(e.to_string())
    }
}
