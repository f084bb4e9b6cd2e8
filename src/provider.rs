//! Client-side document provider.
//!
//! Bridges a local Yrs document (plus its awareness instance) to the hub:
//!
//! - **Local updates** are intercepted via the doc's update observer,
//!   filtered by origin (updates the provider itself applied are skipped),
//!   queued, and flushed as one merged `yjs-update` — immediately when
//!   [`MAX_QUEUE_SIZE`] updates are pending, otherwise [`DEBOUNCE_WAIT`]
//!   after the most recent enqueue.
//! - **Remote updates** are applied with the provider's origin so the
//!   local observer ignores them; a `yjs-sync` additionally flips the
//!   provider to synced and notifies listeners.
//! - **Awareness** changes (added ∪ updated ∪ removed client ids) are
//!   encoded into a single awareness update and relayed; inbound awareness
//!   is applied behind a guard so it is not re-emitted.
//! - **Reconnect**: after a drop, the next [`connect`] sends
//!   `rejoin-document` with the local state vector and receives only the
//!   missing updates; a refused rejoin falls back to a full join.
//!
//! [`connect`]: DocProvider::connect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, Subscription, Transact, Update};

use crate::protocol::{ClientMessage, PeerIdentity, ServerMessage};

/// Pending local updates that force an immediate flush.
pub const MAX_QUEUE_SIZE: usize = 10;

/// Debounce window after the most recent enqueue.
pub const DEBOUNCE_WAIT: Duration = Duration::from_millis(50);

/// How long to wait for a join ack before giving up.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Origin tag for updates the provider applies locally.
const PROVIDER_ORIGIN: &str = "cowrite-provider";

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    /// Initial (or incremental) server state has been applied.
    Synced,
    PeerJoined {
        user_id: String,
        display_name: String,
        email: String,
    },
    PeerLeft {
        user_id: String,
        display_name: String,
        email: String,
    },
    PermissionDenied {
        document_id: String,
        message: String,
    },
}

/// Provider errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("join refused: {0}")]
    JoinRefused(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("timed out waiting for ack")]
    AckTimeout,
    #[error("not connected")]
    NotConnected,
}

/// Signals into the debounce task.
enum LocalSignal {
    Update(Vec<u8>),
    Flush,
}

type AckPayload = (bool, Option<String>, Vec<PeerIdentity>);
type AckSlot = Arc<StdMutex<Option<oneshot::Sender<AckPayload>>>>;

/// The provider: one local doc, one document id, one hub connection.
pub struct DocProvider {
    document_id: String,
    server_url: String,
    token: String,
    origin: Origin,

    doc: Doc,
    awareness: Arc<StdMutex<Awareness>>,
    /// Set while a remote awareness update is being applied, so the
    /// awareness observer does not re-emit it.
    applying_remote: Arc<AtomicBool>,

    synced: Arc<AtomicBool>,
    /// A previous session existed; the next connect should rejoin with the
    /// local state vector.
    pending_rejoin: Arc<AtomicBool>,

    event_tx: mpsc::Sender<ProviderEvent>,
    event_rx: Option<mpsc::Receiver<ProviderEvent>>,

    outgoing: Option<mpsc::Sender<Message>>,
    local_tx: Option<mpsc::UnboundedSender<LocalSignal>>,
    ack_slot: AckSlot,

    doc_sub: Option<Subscription>,
    awareness_sub: Option<Subscription>,
}

impl DocProvider {
    /// Create a provider for `doc`. The doc handle is shared: the
    /// application keeps editing through its own clone.
    pub fn new(
        doc: Doc,
        document_id: impl Into<String>,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let awareness = Arc::new(StdMutex::new(Awareness::new(doc.clone())));
        Self {
            document_id: document_id.into(),
            server_url: server_url.into(),
            token: token.into(),
            origin: Origin::from(PROVIDER_ORIGIN),
            doc,
            awareness,
            applying_remote: Arc::new(AtomicBool::new(false)),
            synced: Arc::new(AtomicBool::new(false)),
            pending_rejoin: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Some(event_rx),
            outgoing: None,
            local_tx: None,
            ack_slot: Arc::new(StdMutex::new(None)),
            doc_sub: None,
            awareness_sub: None,
        }
    }

    /// Take the event receiver (once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.event_rx.take()
    }

    /// The shared doc handle.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Set this client's awareness state (JSON), which the awareness
    /// observer relays to the room.
    pub fn set_awareness_state(&self, json: impl Into<String>) {
        if let Ok(mut awareness) = self.awareness.lock() {
            awareness.set_local_state(json.into());
        }
    }

    /// Connect to the hub, subscribe the doc and awareness observers, and
    /// join (or rejoin) the document. Returns once the join ack arrived.
    pub async fn connect(&mut self) -> Result<(), ProviderError> {
        // A dead connection (writer gone after a drop) may be replaced; a
        // live one may not.
        if let Some(tx) = &self.outgoing {
            if !tx.is_closed() {
                return Err(ProviderError::ConnectionFailed("already connected".into()));
            }
        }
        let url = format!("{}/?token={}", self.server_url, self.token);
        let (ws, _resp) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            if let tokio_tungstenite::tungstenite::Error::Http(resp) = &e {
                if resp.status().as_u16() == 401 {
                    return ProviderError::Unauthorized;
                }
            }
            ProviderError::ConnectionFailed(e.to_string())
        })?;
        let (mut sink, stream) = ws.split();

        // Writer task: the only writer to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            // All senders gone (detach): close the socket so the hub sees
            // the departure promptly.
            let _ = sink.close().await;
        });
        self.outgoing = Some(out_tx.clone());

        // Debounce task: coalesce local updates into single wire frames.
        let (local_tx, local_rx) = mpsc::unbounded_channel::<LocalSignal>();
        tokio::spawn(debounce_loop(
            self.document_id.clone(),
            local_rx,
            out_tx.clone(),
        ));
        self.local_tx = Some(local_tx.clone());

        // Doc observer: forward local updates (skipping our own origin).
        // Recreated per connection so it feeds this connection's debounce
        // task; the replaced subscription drops the old observer.
        {
            let origin = self.origin.clone();
            let tx = local_tx.clone();
            let sub = self
                .doc
                .observe_update_v1(move |txn, event| {
                    if txn.origin() == Some(&origin) {
                        return;
                    }
                    let _ = tx.send(LocalSignal::Update(event.update.clone()));
                })
                .map_err(|e| ProviderError::Subscribe(e.to_string()))?;
            self.doc_sub = Some(sub);
        }

        // Awareness observer: relay local awareness changes.
        {
            let tx = out_tx.clone();
            let document_id = self.document_id.clone();
            let applying_remote = self.applying_remote.clone();
            let mut awareness = self
                .awareness
                .lock()
                .map_err(|_| ProviderError::Subscribe("awareness lock poisoned".into()))?;
            let sub = awareness.on_update(move |awareness, event, _origin| {
                if applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                let changed: Vec<u64> = event
                    .added()
                    .iter()
                    .chain(event.updated().iter())
                    .chain(event.removed().iter())
                    .copied()
                    .collect();
                if changed.is_empty() {
                    return;
                }
                if let Ok(update) = awareness.update_with_clients(changed) {
                    let msg = ClientMessage::YjsAwareness {
                        document_id: document_id.clone(),
                        update: update.encode_v1(),
                    };
                    if let Ok(json) = msg.encode() {
                        let _ = tx.try_send(Message::Text(json.into()));
                    }
                }
            });
            self.awareness_sub = Some(sub);
        }

        // Reader task: apply remote state, surface events, route acks.
        tokio::spawn(reader_loop(ReaderCtx {
            stream,
            doc: self.doc.clone(),
            origin: self.origin.clone(),
            awareness: self.awareness.clone(),
            applying_remote: self.applying_remote.clone(),
            synced: self.synced.clone(),
            pending_rejoin: self.pending_rejoin.clone(),
            event_tx: self.event_tx.clone(),
            ack_slot: self.ack_slot.clone(),
        }));

        let _ = self.event_tx.send(ProviderEvent::Connected).await;

        // Rejoin with the local state vector when resuming a session;
        // fall back to a full join if the hub refuses it.
        if self.pending_rejoin.swap(false, Ordering::SeqCst) {
            let state_vector = crate::sync::encode_state_vector(&self.doc);
            let rejoin = ClientMessage::RejoinDocument {
                document_id: self.document_id.clone(),
                state_vector,
            };
            match self.request_join(rejoin).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "rejoin of {} refused ({e}); falling back to full join",
                        self.document_id
                    );
                }
            }
        }

        let join = ClientMessage::JoinDocument {
            document_id: self.document_id.clone(),
        };
        self.request_join(join).await
    }

    /// Send a join/rejoin request and wait for its ack.
    async fn request_join(&self, msg: ClientMessage) -> Result<(), ProviderError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Ok(mut slot) = self.ack_slot.lock() {
            *slot = Some(ack_tx);
        }
        self.send_message(&msg).await?;

        let (success, error, _users) = tokio::time::timeout(ACK_TIMEOUT, ack_rx)
            .await
            .map_err(|_| ProviderError::AckTimeout)?
            .map_err(|_| ProviderError::NotConnected)?;
        if success {
            Ok(())
        } else {
            Err(ProviderError::JoinRefused(
                error.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }

    async fn send_message(&self, msg: &ClientMessage) -> Result<(), ProviderError> {
        let json = msg
            .encode()
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        let tx = self.outgoing.as_ref().ok_or(ProviderError::NotConnected)?;
        tx.send(Message::Text(json.into()))
            .await
            .map_err(|_| ProviderError::NotConnected)
    }

    /// Detach from the hub: best-effort flush of pending local updates,
    /// unsubscribe the doc and awareness observers, clear the local
    /// awareness state, and drop the socket tasks.
    pub async fn detach(&mut self) {
        // Flush before the observers go away.
        if let Some(local_tx) = &self.local_tx {
            let _ = local_tx.send(LocalSignal::Flush);
        }
        // Announce our departure to awareness peers while the socket may
        // still be up.
        if let Ok(mut awareness) = self.awareness.lock() {
            awareness.clean_local_state();
        }
        // Give the debounce/writer pipeline a beat to drain.
        tokio::time::sleep(Duration::from_millis(10)).await;

        self.doc_sub = None;
        self.awareness_sub = None;
        self.local_tx = None;
        self.outgoing = None;
        self.synced.store(false, Ordering::SeqCst);
        self.pending_rejoin.store(false, Ordering::SeqCst);
    }
}

/// Everything the reader task needs.
struct ReaderCtx {
    stream: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    doc: Doc,
    origin: Origin,
    awareness: Arc<StdMutex<Awareness>>,
    applying_remote: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,
    pending_rejoin: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ProviderEvent>,
    ack_slot: AckSlot,
}

async fn reader_loop(mut ctx: ReaderCtx) {
    while let Some(frame) = ctx.stream.next().await {
        let txt = match frame {
            Ok(Message::Text(txt)) => txt,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let msg = match ServerMessage::decode(txt.as_str()) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable server frame dropped: {e}");
                continue;
            }
        };
        match msg {
            ServerMessage::YjsSync { update, .. } => {
                apply_update(&ctx.doc, &ctx.origin, &update);
                ctx.synced.store(true, Ordering::SeqCst);
                let _ = ctx.event_tx.send(ProviderEvent::Synced).await;
            }
            ServerMessage::YjsUpdate { update, .. } => {
                apply_update(&ctx.doc, &ctx.origin, &update);
            }
            ServerMessage::YjsAwareness { update, .. } => {
                match AwarenessUpdate::decode_v1(&update) {
                    Ok(update) => {
                        if let Ok(mut awareness) = ctx.awareness.lock() {
                            ctx.applying_remote.store(true, Ordering::SeqCst);
                            if let Err(e) = awareness.apply_update(update) {
                                log::warn!("awareness apply failed: {e}");
                            }
                            ctx.applying_remote.store(false, Ordering::SeqCst);
                        }
                    }
                    Err(e) => log::warn!("undecodable awareness update dropped: {e}"),
                }
            }
            ServerMessage::JoinAck {
                success,
                users,
                error,
                ..
            } => {
                let ack = ctx.ack_slot.lock().ok().and_then(|mut slot| slot.take());
                if let Some(ack) = ack {
                    let _ = ack.send((success, error, users.unwrap_or_default()));
                }
            }
            ServerMessage::UserJoined {
                user_id,
                display_name,
                email,
                ..
            } => {
                let _ = ctx
                    .event_tx
                    .send(ProviderEvent::PeerJoined {
                        user_id,
                        display_name,
                        email,
                    })
                    .await;
            }
            ServerMessage::UserLeft {
                user_id,
                display_name,
                email,
                ..
            } => {
                let _ = ctx
                    .event_tx
                    .send(ProviderEvent::PeerLeft {
                        user_id,
                        display_name,
                        email,
                    })
                    .await;
            }
            ServerMessage::PermissionDenied {
                document_id,
                message,
            } => {
                let _ = ctx
                    .event_tx
                    .send(ProviderEvent::PermissionDenied {
                        document_id,
                        message,
                    })
                    .await;
            }
        }
    }

    // Transport gone: mark unsynced and arm the rejoin path.
    ctx.synced.store(false, Ordering::SeqCst);
    ctx.pending_rejoin.store(true, Ordering::SeqCst);
    let _ = ctx.event_tx.send(ProviderEvent::Disconnected).await;
}

fn apply_update(doc: &Doc, origin: &Origin, bytes: &[u8]) {
    match Update::decode_v1(bytes) {
        Ok(update) => {
            let mut txn = doc.transact_mut_with(origin.clone());
            if let Err(e) = txn.apply_update(update) {
                log::warn!("remote update apply failed: {e}");
            }
        }
        Err(e) => log::warn!("undecodable remote update dropped: {e}"),
    }
}

/// Coalesce local updates: flush immediately at [`MAX_QUEUE_SIZE`] pending
/// updates, otherwise [`DEBOUNCE_WAIT`] after the most recent enqueue.
async fn debounce_loop(
    document_id: String,
    mut rx: mpsc::UnboundedReceiver<LocalSignal>,
    out: mpsc::Sender<Message>,
) {
    let mut pending: Vec<Vec<u8>> = Vec::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(LocalSignal::Update(update)) => pending.push(update),
                Some(LocalSignal::Flush) => continue,
                None => break,
            }
            if pending.len() >= MAX_QUEUE_SIZE {
                flush_pending(&document_id, &mut pending, &out).await;
            }
        } else {
            // The timer restarts after every enqueue.
            tokio::select! {
                signal = rx.recv() => match signal {
                    Some(LocalSignal::Update(update)) => {
                        pending.push(update);
                        if pending.len() >= MAX_QUEUE_SIZE {
                            flush_pending(&document_id, &mut pending, &out).await;
                        }
                    }
                    Some(LocalSignal::Flush) => {
                        flush_pending(&document_id, &mut pending, &out).await;
                    }
                    None => {
                        flush_pending(&document_id, &mut pending, &out).await;
                        break;
                    }
                },
                _ = tokio::time::sleep(DEBOUNCE_WAIT) => {
                    flush_pending(&document_id, &mut pending, &out).await;
                }
            }
        }
    }
}

/// Merge the pending buffer into one update and emit a single frame.
async fn flush_pending(document_id: &str, pending: &mut Vec<Vec<u8>>, out: &mpsc::Sender<Message>) {
    if pending.is_empty() {
        return;
    }
    let updates: Vec<Update> = pending
        .drain(..)
        .filter_map(|bytes| match Update::decode_v1(&bytes) {
            Ok(update) => Some(update),
            Err(e) => {
                log::warn!("skipping undecodable local update: {e}");
                None
            }
        })
        .collect();
    if updates.is_empty() {
        return;
    }
    let merged = Update::merge_updates(updates);
    let msg = ClientMessage::YjsUpdate {
        document_id: document_id.to_string(),
        update: merged.encode_v1(),
    };
    match msg.encode() {
        Ok(json) => {
            let _ = out.send(Message::Text(json.into())).await;
        }
        Err(e) => log::error!("failed to encode coalesced update: {e}"),
    }
}
