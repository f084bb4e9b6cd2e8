//! The collaboration hub: WebSocket server and per-session dispatcher.
//!
//! Each connection is authenticated at the handshake, bound to a verified
//! identity, and served by an independent task — messages on one session
//! never serialize with messages on another, while messages within a
//! session are dispatched in arrival order.
//!
//! ```text
//! accept ─► handshake auth ─► session task
//!                               │
//!              ┌────────────────┼───────────────────┐
//!              ▼                ▼                   ▼
//!        join-document     yjs-update          yjs-awareness
//!        rejoin-document   (role re-check,     (relay to room)
//!        leave-document     apply, fan-out)
//! ```
//!
//! The dispatcher never blocks on I/O to another session: fan-out happens
//! after the per-document lock is released, through bounded per-session
//! buffers, and a peer that saturates its buffer is kicked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::AccessControl;
use crate::auth::{token_from_query, AuthGate, Identity};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::protocol::{
    validate_document_id, ClientMessage, ServerMessage, PROTO_HEADER, PROTO_VERSION,
};
use crate::replica::{spawn_reaper, ReplicaRegistry};
use crate::rooms::{OutboundHandle, RoomRegistry, Subscriber};
use crate::store::MetadataStore;

/// Hub-wide counters (lock-free; read via [`CollabHub::stats`]).
#[derive(Default)]
struct HubCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    kicked_sessions: AtomicU64,
}

/// Snapshot of hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub kicked_sessions: u64,
    pub active_rooms: usize,
    pub live_replicas: usize,
}

/// The collaboration hub.
///
/// Cheap to clone; all state is shared. Construct once, then [`run`] (or
/// [`serve`] a pre-bound listener) and finally [`shutdown`] to flush
/// snapshots.
///
/// [`run`]: CollabHub::run
/// [`serve`]: CollabHub::serve
/// [`shutdown`]: CollabHub::shutdown
#[derive(Clone)]
pub struct CollabHub {
    config: Arc<HubConfig>,
    store: Arc<dyn MetadataStore>,
    auth: Arc<AuthGate>,
    access: Arc<AccessControl>,
    replicas: Arc<ReplicaRegistry>,
    rooms: Arc<RoomRegistry>,
    counters: Arc<HubCounters>,
}

impl CollabHub {
    pub fn new(config: HubConfig, store: Arc<dyn MetadataStore>) -> Self {
        let auth = Arc::new(AuthGate::new(&config.jwt_secret, store.clone()));
        let access = Arc::new(AccessControl::new(store.clone()));
        let replicas = Arc::new(ReplicaRegistry::new(
            store.clone(),
            config.save_interval,
            config.inactive_timeout,
        ));
        Self {
            config: Arc::new(config),
            store,
            auth,
            access,
            replicas,
            rooms: Arc::new(RoomRegistry::new()),
            counters: Arc::new(HubCounters::default()),
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration hub listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve a pre-bound listener (lets tests bind port 0).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        let _reaper = spawn_reaper(
            self.replicas.clone(),
            self.rooms.clone(),
            self.config.cleanup_check_interval,
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("accepted TCP connection from {peer}");
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream).await {
                            log::debug!("session from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("accept failed: {e}; continuing");
                }
            }
        }
    }

    /// Retire every live replica, flushing final snapshots.
    pub async fn shutdown(&self) {
        log::info!("hub shutting down; flushing snapshots");
        self.replicas.retire_all().await;
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            kicked_sessions: self.counters.kicked_sessions.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            live_replicas: self.replicas.len().await,
        }
    }

    /// The replica registry (test observability).
    pub fn replicas(&self) -> &Arc<ReplicaRegistry> {
        &self.replicas
    }

    /// The room registry (test observability).
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Handle one socket: handshake, dispatcher loop, cleanup.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), HubError> {
        // Token verification and the origin check run inside the upgrade
        // callback, so missing/invalid credentials refuse the connection
        // with a plain HTTP 401/403 before the socket exists.
        let auth = self.auth.clone();
        let cors_origin = self.config.cors_origin.clone();
        let verified: Arc<std::sync::Mutex<Option<String>>> =
            Arc::new(std::sync::Mutex::new(None));
        let verified_cb = verified.clone();

        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                if let Some(expected) = &cors_origin {
                    let origin = req
                        .headers()
                        .get("origin")
                        .and_then(|v| v.to_str().ok());
                    if let Some(origin) = origin {
                        if origin != expected {
                            log::warn!("handshake rejected: origin {origin} not allowed");
                            return Err(refusal(StatusCode::FORBIDDEN, "origin not allowed"));
                        }
                    }
                }

                let token = token_from_query(req.uri().query());
                match auth.verify_token(token) {
                    Ok(user_id) => {
                        if let Ok(mut guard) = verified_cb.lock() {
                            *guard = Some(user_id);
                        }
                    }
                    Err(e) => {
                        log::warn!("handshake rejected: {e}");
                        return Err(refusal(StatusCode::UNAUTHORIZED, &e.to_string()));
                    }
                }

                // Advertise the wire encoding.
                resp.headers_mut()
                    .insert(PROTO_HEADER, HeaderValue::from_static(PROTO_VERSION));
                Ok(resp)
            },
        )
        .await?;

        let user_id = verified
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| HubError::Transport("handshake state lost".into()))?;

        // The user lookup is async store I/O, so it happens after the
        // upgrade; unknown users are closed with a reason before any
        // dispatcher state exists.
        let identity = match self.auth.resolve_identity(&user_id).await {
            Ok(identity) => identity,
            Err(e) => {
                let mut ws = ws;
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: e.to_string().into(),
                    }))
                    .await;
                return Ok(());
            }
        };

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let session = SessionCtx {
            session_id: Uuid::new_v4(),
            identity,
        };
        log::info!(
            "session {} established for {} ({})",
            session.session_id,
            session.identity.id,
            session.identity.email
        );

        let result = self.dispatch_session(ws, &session).await;

        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("session {} closed", session.session_id);
        result
    }

    /// The per-session dispatcher loop.
    async fn dispatch_session(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        session: &SessionCtx,
    ) -> Result<(), HubError> {
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::channel::<Message>(self.config.outbound_capacity);
        let kick = Arc::new(Notify::new());
        let outbound = OutboundHandle::new(tx, kick.clone());

        // Writer task: the only writer to the socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Documents this session has joined.
        let mut joined: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(txt))) => {
                            self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            self.counters.total_bytes.fetch_add(txt.len() as u64, Ordering::Relaxed);
                            match ClientMessage::decode(txt.as_str()) {
                                Ok(msg) => {
                                    self.dispatch_message(session, &outbound, &mut joined, msg)
                                        .await;
                                }
                                Err(e) => {
                                    // Malformed payloads are dropped; the
                                    // connection stays up.
                                    log::warn!(
                                        "session {}: undecodable frame dropped: {e}",
                                        session.session_id
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = outbound.deliver(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            log::debug!(
                                "session {}: non-text frame ignored",
                                session.session_id
                            );
                        }
                        Some(Err(e)) => {
                            log::debug!("session {} transport error: {e}", session.session_id);
                            break;
                        }
                    }
                }
                _ = kick.notified() => {
                    self.counters.kicked_sessions.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "session {} kicked (outbound buffer saturated)",
                        session.session_id
                    );
                    break;
                }
            }
        }

        // Teardown: leave every joined room and let empty rooms retire
        // their replica. Snapshot writes in flight run to completion.
        for document_id in joined {
            self.leave_room(session, &document_id).await;
        }

        drop(outbound);
        let _ = writer.await;
        Ok(())
    }

    async fn dispatch_message(
        &self,
        session: &SessionCtx,
        outbound: &OutboundHandle,
        joined: &mut Vec<String>,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::JoinDocument { document_id } => {
                self.handle_join(session, outbound, joined, &document_id, None)
                    .await;
            }
            ClientMessage::RejoinDocument {
                document_id,
                state_vector,
            } => {
                self.handle_join(session, outbound, joined, &document_id, Some(state_vector))
                    .await;
            }
            ClientMessage::LeaveDocument { document_id } => {
                if let Some(pos) = joined.iter().position(|d| d == &document_id) {
                    joined.remove(pos);
                    self.leave_room(session, &document_id).await;
                }
                // Leaving a never-joined document is a silent no-op.
            }
            ClientMessage::YjsUpdate {
                document_id,
                update,
            } => {
                self.handle_update(session, outbound, joined, &document_id, update)
                    .await;
            }
            ClientMessage::YjsAwareness {
                document_id,
                update,
            } => {
                // Membership is the only gate for awareness; viewers may
                // broadcast cursors. Nothing is persisted.
                if joined.iter().any(|d| d == &document_id) {
                    self.rooms
                        .broadcast(
                            &document_id,
                            session.session_id,
                            &ServerMessage::YjsAwareness {
                                document_id: document_id.clone(),
                                update,
                                user_id: session.identity.id.clone(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// `join-document` / `rejoin-document`: authorize, hydrate, sync, ack,
    /// announce.
    async fn handle_join(
        &self,
        session: &SessionCtx,
        outbound: &OutboundHandle,
        joined: &mut Vec<String>,
        document_id: &str,
        state_vector: Option<Vec<u8>>,
    ) {
        if validate_document_id(document_id).is_err() {
            send(outbound, &ServerMessage::join_err(document_id, "invalid document id")).await;
            return;
        }

        let role = match self.access.resolve_role(&session.identity.id, document_id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                send(outbound, &ServerMessage::join_err(document_id, "access denied")).await;
                return;
            }
            Err(e) => {
                log::error!("role resolution failed for {document_id}: {e}");
                send(outbound, &ServerMessage::join_err(document_id, "internal error")).await;
                return;
            }
        };

        let mut slot = self.replicas.acquire(document_id).await;

        let subscriber = Subscriber {
            user_id: session.identity.id.clone(),
            display_name: session.identity.name.clone(),
            email: session.identity.email.clone(),
            role,
        };
        let (users, was_present) = self
            .rooms
            .join(document_id, session.session_id, subscriber, outbound.clone())
            .await;

        // A concurrent retirement may have fired between acquire and the
        // presence insert; the room is non-empty now, so a fresh acquire
        // sticks.
        if slot.is_retired().await {
            slot = self.replicas.acquire(document_id).await;
        }
        slot.touch().await;

        // Sync precedes the ack: full state on join, the missing diff on
        // rejoin.
        let update = slot.encode_diff(state_vector.as_deref()).await;
        send(
            outbound,
            &ServerMessage::YjsSync {
                document_id: document_id.to_string(),
                update,
            },
        )
        .await;

        let peer_list = users.iter().map(|s| s.to_peer_identity()).collect();
        send(outbound, &ServerMessage::join_ok(document_id, peer_list)).await;

        if !joined.iter().any(|d| d == document_id) {
            joined.push(document_id.to_string());
        }

        // A duplicate join overwrote the existing presence entry; peers
        // already saw this session arrive once.
        if !was_present {
            self.rooms
                .broadcast(
                    document_id,
                    session.session_id,
                    &ServerMessage::UserJoined {
                        document_id: document_id.to_string(),
                        user_id: session.identity.id.clone(),
                        display_name: session.identity.name.clone(),
                        email: session.identity.email.clone(),
                    },
                )
                .await;
        }

        log::info!(
            "session {} joined {document_id} as {} ({role})",
            session.session_id,
            session.identity.id
        );
    }

    /// `yjs-update`: re-authorize, apply to the authoritative replica,
    /// maybe snapshot, fan out.
    async fn handle_update(
        &self,
        session: &SessionCtx,
        outbound: &OutboundHandle,
        joined: &[String],
        document_id: &str,
        update: Vec<u8>,
    ) {
        if !joined.iter().any(|d| d == document_id) {
            send(
                outbound,
                &ServerMessage::PermissionDenied {
                    document_id: document_id.to_string(),
                    message: "not subscribed to this document".into(),
                },
            )
            .await;
            return;
        }

        // Role is re-resolved on every update so revocations and
        // downgrades apply mid-session.
        let role = match self.access.resolve_role(&session.identity.id, document_id).await {
            Ok(role) => role,
            Err(e) => {
                log::error!("role re-check failed for {document_id}: {e}; update dropped");
                return;
            }
        };
        match role {
            Some(role) if role.can_edit() => {}
            _ => {
                send(
                    outbound,
                    &ServerMessage::PermissionDenied {
                        document_id: document_id.to_string(),
                        message: "viewers cannot edit this document".into(),
                    },
                )
                .await;
                return;
            }
        }

        let slot = match self.replicas.peek(document_id).await {
            Some(slot) => slot,
            // The replica can only be gone if retirement raced the update;
            // rehydrate from the snapshot it just wrote.
            None => self.replicas.acquire(document_id).await,
        };

        match slot
            .apply_update(&update, self.config.update_threshold)
            .await
        {
            Ok(save_due) => {
                if save_due {
                    let store = self.store.clone();
                    let slot = slot.clone();
                    tokio::spawn(crate::snapshot::save(slot, store));
                }
            }
            Err(e) => {
                log::warn!(
                    "session {}: malformed update for {document_id} dropped: {e}",
                    session.session_id
                );
                return;
            }
        }

        // Fan-out happens after the replica absorbed the update, so peers
        // may assume the server is at least as new as what they receive.
        self.rooms
            .broadcast(
                document_id,
                session.session_id,
                &ServerMessage::YjsUpdate {
                    document_id: document_id.to_string(),
                    update,
                    user_id: session.identity.id.clone(),
                },
            )
            .await;
    }

    /// Presence leave + departure broadcast + retirement check.
    async fn leave_room(&self, session: &SessionCtx, document_id: &str) {
        let Some((subscriber, now_empty)) =
            self.rooms.leave(document_id, session.session_id).await
        else {
            return;
        };
        self.rooms
            .broadcast(
                document_id,
                session.session_id,
                &ServerMessage::UserLeft {
                    document_id: document_id.to_string(),
                    user_id: subscriber.user_id,
                    display_name: subscriber.display_name,
                    email: subscriber.email,
                },
            )
            .await;
        if now_empty {
            self.replicas.retire(document_id, &self.rooms).await;
        }
    }
}

/// Per-session context: the verified identity and the server-assigned id.
struct SessionCtx {
    session_id: Uuid,
    identity: Identity,
}

/// Encode and queue a directed message on the session's own channel.
async fn send(outbound: &OutboundHandle, message: &ServerMessage) {
    match message.encode() {
        Ok(json) => {
            let _ = outbound.deliver(Message::Text(json.into())).await;
        }
        Err(e) => log::error!("failed to encode directed message: {e}"),
    }
}

/// Build an HTTP refusal for the upgrade handshake.
fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    Response::builder()
        .status(status)
        .body(Some(reason.to_string()))
        .unwrap_or_else(|_| {
            let mut resp = ErrorResponse::new(None);
            *resp.status_mut() = status;
            resp
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_hub_initial_stats() {
        let hub = CollabHub::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.live_replicas, 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_replicas() {
        let hub = CollabHub::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        hub.shutdown().await;
        assert!(hub.replicas().is_empty().await);
    }
}
