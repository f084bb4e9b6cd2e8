//! Room membership, presence, and broadcast fan-out.
//!
//! A room is the set of sessions currently subscribed to one document id.
//! The registry owns the presence maps and holds, per subscriber, the
//! session's bounded outbound sender — sessions are referenced by id only,
//! so a dying session just walks its joined ids and purges itself.
//!
//! Fan-out never blocks on a slow peer: broadcasts use `try_send`, and a
//! peer whose outbound buffer is saturated gets kicked (its socket is
//! closed; it reconnects and resyncs via state-vector diff).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::Role;
use crate::protocol::{PeerIdentity, ServerMessage};

/// Identity tuple of one room subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
}

impl Subscriber {
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }
}

/// Handle to a session's outbound channel plus its kick signal.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<Message>,
    kick: Arc<Notify>,
}

/// Outcome of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Buffer full: the session was kicked and will tear itself down
    /// (leaving its rooms with proper departure broadcasts).
    Saturated,
    /// The session's writer is gone.
    Closed,
}

impl OutboundHandle {
    pub fn new(tx: mpsc::Sender<Message>, kick: Arc<Notify>) -> Self {
        Self { tx, kick }
    }

    /// Queue a frame without blocking. A full buffer kicks the session.
    pub fn try_deliver(&self, frame: Message) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("outbound buffer saturated; kicking slow session");
                self.kick.notify_one();
                Delivery::Saturated
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a directed frame, waiting for buffer space. Only the
    /// session's own dispatcher may use this (it never waits on another
    /// session's buffer).
    pub async fn deliver(&self, frame: Message) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

struct RoomEntry {
    subscriber: Subscriber,
    outbound: OutboundHandle,
}

#[derive(Default)]
struct Room {
    entries: HashMap<Uuid, RoomEntry>,
}

/// Registry of per-document rooms. A room exists iff it has subscribers.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a session into a document's room and return the subscriber
    /// list observed at that instant (including the new entry), plus
    /// whether the session was already present. Re-joining with the same
    /// session id overwrites the previous entry.
    pub async fn join(
        &self,
        document_id: &str,
        session_id: Uuid,
        subscriber: Subscriber,
        outbound: OutboundHandle,
    ) -> (Vec<Subscriber>, bool) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(document_id.to_string()).or_default();
        let was_present = room
            .entries
            .insert(
                session_id,
                RoomEntry {
                    subscriber,
                    outbound,
                },
            )
            .is_some();
        let users = room
            .entries
            .values()
            .map(|e| e.subscriber.clone())
            .collect();
        (users, was_present)
    }

    /// Remove a session from a document's room. Returns the removed
    /// subscriber and whether the room became empty (and was dropped).
    /// Leaving a room that was never joined is a silent no-op.
    pub async fn leave(&self, document_id: &str, session_id: Uuid) -> Option<(Subscriber, bool)> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get_mut(document_id)?;
        let removed = room.entries.remove(&session_id)?;
        let now_empty = room.entries.is_empty();
        if now_empty {
            rooms.remove(document_id);
        }
        Some((removed.subscriber, now_empty))
    }

    /// Session ids subscribed to a document, excluding one — the fan-out
    /// target list.
    pub async fn peers(&self, document_id: &str, except: Uuid) -> Vec<Uuid> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(document_id)
            .map(|room| {
                room.entries
                    .keys()
                    .filter(|id| **id != except)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identity tuples of everyone subscribed to a document.
    pub async fn users_in(&self, document_id: &str) -> Vec<Subscriber> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(document_id)
            .map(|room| {
                room.entries
                    .values()
                    .map(|e| e.subscriber.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a document's room is currently empty (or absent).
    pub async fn is_empty(&self, document_id: &str) -> bool {
        let rooms = self.rooms.lock().await;
        rooms
            .get(document_id)
            .map(|room| room.entries.is_empty())
            .unwrap_or(true)
    }

    /// Whether the given session is subscribed to the document.
    pub async fn contains(&self, document_id: &str, session_id: Uuid) -> bool {
        let rooms = self.rooms.lock().await;
        rooms
            .get(document_id)
            .map(|room| room.entries.contains_key(&session_id))
            .unwrap_or(false)
    }

    /// Broadcast a message to every subscriber except `from`. The frame is
    /// encoded once; queuing never blocks, and sessions whose channel has
    /// closed are purged from the room.
    pub async fn broadcast(&self, document_id: &str, from: Uuid, message: &ServerMessage) {
        let frame = match message.encode() {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                log::error!("failed to encode broadcast for {document_id}: {e}");
                return;
            }
        };

        // Collect targets under the lock, deliver outside it.
        let targets: Vec<(Uuid, OutboundHandle)> = {
            let rooms = self.rooms.lock().await;
            match rooms.get(document_id) {
                Some(room) => room
                    .entries
                    .iter()
                    .filter(|(id, _)| **id != from)
                    .map(|(id, e)| (*id, e.outbound.clone()))
                    .collect(),
                None => return,
            }
        };

        // Saturated peers were kicked by try_deliver and will leave their
        // rooms through their own teardown (emitting user-left); only
        // peers whose writer is already gone get purged here.
        let mut dead: Vec<Uuid> = Vec::new();
        for (session_id, outbound) in &targets {
            if outbound.try_deliver(frame.clone()) == Delivery::Closed {
                dead.push(*session_id);
            }
        }

        if !dead.is_empty() {
            let mut rooms = self.rooms.lock().await;
            if let Some(room) = rooms.get_mut(document_id) {
                for id in &dead {
                    room.entries.remove(id);
                }
                if room.entries.is_empty() {
                    rooms.remove(document_id);
                }
            }
            log::debug!(
                "removed {} unreachable subscribers from {document_id}",
                dead.len()
            );
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(user: &str, role: Role) -> Subscriber {
        Subscriber {
            user_id: user.into(),
            display_name: format!("User {user}"),
            email: format!("{user}@example.com"),
            role,
        }
    }

    fn handle() -> (OutboundHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (OutboundHandle::new(tx, Arc::new(Notify::new())), rx)
    }

    #[tokio::test]
    async fn test_join_returns_full_list_including_joiner() {
        let rooms = RoomRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        let s1 = Uuid::new_v4();
        let (list, was_present) = rooms.join("d1", s1, subscriber("alice", Role::Owner), h1).await;
        assert_eq!(list.len(), 1);
        assert!(!was_present);

        let s2 = Uuid::new_v4();
        let (list, _) = rooms.join("d1", s2, subscriber("bob", Role::Editor), h2).await;
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|s| s.user_id == "bob"));
    }

    #[tokio::test]
    async fn test_rejoin_same_session_overwrites() {
        let rooms = RoomRegistry::new();
        let session = Uuid::new_v4();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        rooms.join("d1", session, subscriber("alice", Role::Owner), h1).await;
        let (list, was_present) =
            rooms.join("d1", session, subscriber("alice", Role::Owner), h2).await;
        assert_eq!(list.len(), 1);
        assert!(was_present);
        assert_eq!(rooms.users_in("d1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_drops_empty_room() {
        let rooms = RoomRegistry::new();
        let session = Uuid::new_v4();
        let (h, _rx) = handle();

        rooms.join("d1", session, subscriber("alice", Role::Owner), h).await;
        assert_eq!(rooms.room_count().await, 1);

        let (removed, now_empty) = rooms.leave("d1", session).await.unwrap();
        assert_eq!(removed.user_id, "alice");
        assert!(now_empty);
        assert_eq!(rooms.room_count().await, 0);
        assert!(rooms.is_empty("d1").await);
    }

    #[tokio::test]
    async fn test_leave_never_joined_is_noop() {
        let rooms = RoomRegistry::new();
        assert!(rooms.leave("d1", Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_peers_excludes_caller() {
        let rooms = RoomRegistry::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        rooms.join("d1", s1, subscriber("alice", Role::Owner), h1).await;
        rooms.join("d1", s2, subscriber("bob", Role::Editor), h2).await;

        let peers = rooms.peers("d1", s1).await;
        assert_eq!(peers, vec![s2]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_peers_not_sender() {
        let rooms = RoomRegistry::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();

        rooms.join("d1", s1, subscriber("alice", Role::Owner), h1).await;
        rooms.join("d1", s2, subscriber("bob", Role::Editor), h2).await;

        let msg = ServerMessage::UserJoined {
            document_id: "d1".into(),
            user_id: "bob".into(),
            display_name: "Bob".into(),
            email: "bob@example.com".into(),
        };
        rooms.broadcast("d1", s2, &msg).await;

        assert!(rx1.try_recv().is_ok(), "peer should receive broadcast");
        assert!(rx2.try_recv().is_err(), "sender must not see its own echo");
    }

    #[tokio::test]
    async fn test_saturated_peer_is_kicked() {
        let rooms = RoomRegistry::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        let (tx, _rx) = mpsc::channel(1);
        let kick = Arc::new(Notify::new());
        let slow = OutboundHandle::new(tx, kick.clone());
        let (fast, _rx2) = handle();

        rooms.join("d1", s1, subscriber("slow", Role::Viewer), slow).await;
        rooms.join("d1", s2, subscriber("fast", Role::Editor), fast).await;

        let msg = ServerMessage::YjsUpdate {
            document_id: "d1".into(),
            update: vec![1],
            user_id: "fast".into(),
        };
        // First fill the slow peer's single-slot buffer, then overflow it.
        rooms.broadcast("d1", s2, &msg).await;
        rooms.broadcast("d1", s2, &msg).await;

        // The kick permit must be waiting.
        tokio::time::timeout(std::time::Duration::from_millis(100), kick.notified())
            .await
            .expect("slow peer should have been kicked");
        // The kicked peer leaves via its own teardown, so presence still
        // lists it until then.
        assert_eq!(rooms.users_in("d1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_peer_purged_on_broadcast() {
        let rooms = RoomRegistry::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        let (tx, rx) = mpsc::channel(8);
        drop(rx); // writer gone
        let gone = OutboundHandle::new(tx, Arc::new(Notify::new()));
        let (live, _rx) = handle();

        rooms.join("d1", s1, subscriber("gone", Role::Editor), gone).await;
        rooms.join("d1", s2, subscriber("live", Role::Editor), live).await;

        let msg = ServerMessage::YjsUpdate {
            document_id: "d1".into(),
            update: vec![1],
            user_id: "live".into(),
        };
        rooms.broadcast("d1", s2, &msg).await;
        assert_eq!(rooms.users_in("d1").await.len(), 1);
    }
}
