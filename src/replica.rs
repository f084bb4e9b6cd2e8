//! Authoritative replica lifecycle.
//!
//! The registry owns the set of live replicas, keyed by document id. A
//! replica is lazily created and hydrated on first join (single-flight:
//! the slot is inserted under the registry lock, hydration is serialized
//! by the per-slot lock, so concurrent joins observe exactly one load),
//! touched on every access, and retired when its room empties — with the
//! inactivity reaper as the backstop for replicas that never saw a clean
//! leave.
//!
//! ```text
//! join ──► acquire ──► hydrate (load snapshot) ──► live ──┐
//!                                                          │ room empty /
//!                                                          │ idle timeout
//!                                                          ▼
//!                                        retire: final save, stop timer,
//!                                                drop from registry
//! ```
//!
//! Lock discipline: the registry lock is never held across store I/O; the
//! per-slot lock guards the doc and its counters and is held across the
//! hydration load (that is what makes creation single-flight) but never
//! across snapshot writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::rooms::RoomRegistry;
use crate::snapshot;
use crate::store::MetadataStore;

/// Mutable state of one authoritative replica.
pub struct ReplicaState {
    pub doc: Doc,
    /// Updates merged since the last successful snapshot.
    pub update_count: u32,
    pub last_access: Instant,
    pub(crate) hydrated: bool,
    pub(crate) retired: bool,
    pub(crate) save_in_flight: bool,
    pub(crate) resave_pending: bool,
    pub(crate) timer: Option<JoinHandle<()>>,
}

/// One live replica: a document id plus its lock-guarded state.
pub struct ReplicaSlot {
    pub document_id: String,
    pub(crate) state: Mutex<ReplicaState>,
}

impl ReplicaSlot {
    fn new(document_id: &str) -> Arc<Self> {
        Arc::new(Self {
            document_id: document_id.to_string(),
            state: Mutex::new(ReplicaState {
                doc: Doc::new(),
                update_count: 0,
                last_access: Instant::now(),
                hydrated: false,
                retired: false,
                save_in_flight: false,
                resave_pending: false,
                timer: None,
            }),
        })
    }

    /// Hydrate the replica from its persisted snapshot and start the
    /// periodic save timer. Idempotent; the slot lock serializes
    /// concurrent callers so the load happens exactly once.
    pub async fn ensure_hydrated(
        self: &Arc<Self>,
        store: Arc<dyn MetadataStore>,
        save_interval: Duration,
    ) {
        let mut state = self.state.lock().await;
        if state.hydrated || state.retired {
            return;
        }
        snapshot::load_into(store.as_ref(), &self.document_id, &mut state).await;
        state.hydrated = true;
        state.last_access = Instant::now();
        state.timer = Some(spawn_save_timer(self.clone(), store, save_interval));
    }

    /// Apply one wire update to the authoritative doc. Returns whether the
    /// update-count threshold was reached (the caller triggers a save).
    /// Malformed bytes are rejected without touching the doc.
    pub async fn apply_update(&self, bytes: &[u8], threshold: u32) -> Result<bool, String> {
        let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
        let mut state = self.state.lock().await;
        {
            let mut txn = state.doc.transact_mut();
            txn.apply_update(update).map_err(|e| e.to_string())?;
        }
        state.update_count += 1;
        state.last_access = Instant::now();
        Ok(state.update_count >= threshold)
    }

    /// Full-state encoding of the current doc.
    pub async fn encode_state(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        crate::sync::encode_full_state(&state.doc)
    }

    /// Diff against a client-reported state vector (full state when the
    /// vector is absent or malformed).
    pub async fn encode_diff(&self, client_state_vector: Option<&[u8]>) -> Vec<u8> {
        let state = self.state.lock().await;
        crate::sync::encode_diff(&state.doc, client_state_vector)
    }

    /// Current state vector of the authoritative doc.
    pub async fn state_vector(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        crate::sync::encode_state_vector(&state.doc)
    }

    pub async fn update_count(&self) -> u32 {
        self.state.lock().await.update_count
    }

    pub async fn is_retired(&self) -> bool {
        self.state.lock().await.retired
    }

    pub async fn touch(&self) {
        self.state.lock().await.last_access = Instant::now();
    }

    /// Mark retired and stop the periodic timer. Returns false when the
    /// slot was already retired.
    pub(crate) async fn mark_retired(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.retired {
            return false;
        }
        state.retired = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        true
    }
}

fn spawn_save_timer(
    slot: Arc<ReplicaSlot>,
    store: Arc<dyn MetadataStore>,
    save_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(save_interval);
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let dirty = {
                let state = slot.state.lock().await;
                if state.retired {
                    break;
                }
                state.update_count > 0
            };
            if dirty {
                snapshot::save(slot.clone(), store.clone()).await;
            }
        }
    })
}

/// Registry of live replicas, keyed by document id.
pub struct ReplicaRegistry {
    replicas: Mutex<HashMap<String, Arc<ReplicaSlot>>>,
    store: Arc<dyn MetadataStore>,
    save_interval: Duration,
    inactive_timeout: Duration,
}

impl ReplicaRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        save_interval: Duration,
        inactive_timeout: Duration,
    ) -> Self {
        Self {
            replicas: Mutex::new(HashMap::new()),
            store,
            save_interval,
            inactive_timeout,
        }
    }

    /// Get the live replica for a document, creating and hydrating it if
    /// absent. Retired slots are replaced with fresh ones, so the returned
    /// slot is always live at the moment of return.
    pub async fn acquire(&self, document_id: &str) -> Arc<ReplicaSlot> {
        loop {
            let slot = {
                let mut replicas = self.replicas.lock().await;
                replicas
                    .entry(document_id.to_string())
                    .or_insert_with(|| ReplicaSlot::new(document_id))
                    .clone()
            };
            slot.ensure_hydrated(self.store.clone(), self.save_interval)
                .await;
            if !slot.is_retired().await {
                return slot;
            }
            // Lost a race with retirement: drop the stale entry and retry.
            let mut replicas = self.replicas.lock().await;
            if let Some(current) = replicas.get(document_id) {
                if Arc::ptr_eq(current, &slot) {
                    replicas.remove(document_id);
                }
            }
        }
    }

    /// Look at a live replica without creating one.
    pub async fn peek(&self, document_id: &str) -> Option<Arc<ReplicaSlot>> {
        self.replicas.lock().await.get(document_id).cloned()
    }

    /// Refresh a replica's last-access stamp.
    pub async fn touch(&self, document_id: &str) {
        if let Some(slot) = self.peek(document_id).await {
            slot.touch().await;
        }
    }

    /// Retire the replica if it exists and its room is empty: persist a
    /// final snapshot, stop the timer, and drop it from the registry.
    /// Returns whether a retirement happened.
    pub async fn retire(&self, document_id: &str, rooms: &RoomRegistry) -> bool {
        let slot = {
            let mut replicas = self.replicas.lock().await;
            let Some(slot) = replicas.get(document_id).cloned() else {
                return false;
            };
            if !rooms.is_empty(document_id).await {
                return false;
            }
            replicas.remove(document_id);
            slot
        };
        if !slot.mark_retired().await {
            return false;
        }
        let dirty = slot.update_count().await > 0;
        if dirty {
            snapshot::save(slot.clone(), self.store.clone()).await;
        }
        log::info!("retired replica for document {document_id}");
        true
    }

    /// Retire every live replica (hub shutdown): final snapshots are
    /// flushed for all of them regardless of room state.
    pub async fn retire_all(&self) {
        let slots: Vec<Arc<ReplicaSlot>> = {
            let mut replicas = self.replicas.lock().await;
            replicas.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if slot.mark_retired().await && slot.update_count().await > 0 {
                snapshot::save(slot.clone(), self.store.clone()).await;
            }
        }
    }

    /// Number of live replicas.
    pub async fn len(&self) -> usize {
        self.replicas.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.replicas.lock().await.is_empty()
    }

    /// One reaper pass: retire replicas idle past the inactivity timeout
    /// whose rooms are empty, and refresh those with active subscribers.
    pub async fn reap(&self, rooms: &RoomRegistry) {
        let candidates: Vec<(String, Arc<ReplicaSlot>)> = {
            let replicas = self.replicas.lock().await;
            replicas
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };
        for (document_id, slot) in candidates {
            if !rooms.is_empty(&document_id).await {
                slot.touch().await;
                continue;
            }
            let idle = {
                let state = slot.state.lock().await;
                state.last_access.elapsed() >= self.inactive_timeout
            };
            if idle {
                self.retire(&document_id, rooms).await;
            }
        }
    }
}

/// Spawn the background reaper loop.
pub fn spawn_reaper(
    registry: Arc<ReplicaRegistry>,
    rooms: Arc<RoomRegistry>,
    cleanup_check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_check_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            registry.reap(&rooms).await;
        }
    })
}
