//! Snapshot persistence.
//!
//! A snapshot is the full-state binary encoding of a replica — the only
//! durable representation of document content. Saves are triggered by the
//! periodic per-replica timer, by the update-count threshold, and by
//! retirement; at most one save per document is in flight, with later
//! triggers coalesced into a re-save after the current write completes.
//!
//! Failures never corrupt in-memory state: a failed write leaves the
//! update count untouched, so the next trigger retries.

use std::sync::Arc;
use std::time::Instant;

use yrs::updates::decoder::Decode;
use yrs::{Transact, Update};

use crate::replica::{ReplicaSlot, ReplicaState};
use crate::store::MetadataStore;

/// Load a document's persisted snapshot into a fresh replica, applying it
/// as a single update. Any failure (missing record, undecodable blob)
/// leaves the replica empty and logs a warning — the next successful save
/// overwrites the stored blob.
pub(crate) async fn load_into(
    store: &dyn MetadataStore,
    document_id: &str,
    state: &mut ReplicaState,
) {
    let record = match store.load_document(document_id).await {
        Ok(record) => record,
        Err(e) => {
            log::warn!("replica load failed for {document_id}: {e}; starting empty");
            return;
        }
    };
    if record.yjs_snapshot.is_empty() {
        log::debug!("no snapshot for {document_id}; starting empty");
        return;
    }
    match Update::decode_v1(&record.yjs_snapshot) {
        Ok(update) => {
            let mut txn = state.doc.transact_mut();
            if let Err(e) = txn.apply_update(update) {
                log::warn!("snapshot apply failed for {document_id}: {e}; starting empty");
            } else {
                log::info!(
                    "hydrated {document_id} from snapshot ({} bytes)",
                    record.yjs_snapshot.len()
                );
            }
        }
        Err(e) => {
            log::warn!("snapshot decode failed for {document_id}: {e}; starting empty");
        }
    }
}

/// Persist the replica's full state.
///
/// Serialized per document: if a save is already in flight this call only
/// flags a re-save and returns; the running save loops once more with the
/// then-current state, so the latest content always reaches the store. On
/// success the update count resets and the access stamp refreshes; on
/// failure both are left alone and the write is retried on the next
/// trigger.
pub async fn save(slot: Arc<ReplicaSlot>, store: Arc<dyn MetadataStore>) {
    loop {
        let blob = {
            let mut state = slot.state.lock().await;
            if state.save_in_flight {
                state.resave_pending = true;
                return;
            }
            state.save_in_flight = true;
            crate::sync::encode_full_state(&state.doc)
        };

        let started = Instant::now();
        let result = store.persist_snapshot(&slot.document_id, &blob).await;

        let mut state = slot.state.lock().await;
        state.save_in_flight = false;
        match result {
            Ok(()) => {
                state.update_count = 0;
                state.last_access = Instant::now();
                log::debug!(
                    "snapshot saved for {} ({} bytes, {} ms)",
                    slot.document_id,
                    blob.len(),
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                log::warn!(
                    "snapshot save failed for {}: {e}; will retry on next trigger",
                    slot.document_id
                );
            }
        }
        if state.resave_pending {
            state.resave_pending = false;
            continue;
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaRegistry;
    use crate::store::{DocumentRecord, MemoryStore};
    use std::time::Duration;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn update_inserting(text: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let t = txn.get_or_insert_text("content");
            t.insert(&mut txn, 0, text);
        }
        crate::sync::encode_full_state(&doc)
    }

    async fn setup() -> (Arc<MemoryStore>, ReplicaRegistry) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_document(DocumentRecord::new("d1", "Notes", "alice"))
            .await
            .unwrap();
        let registry = ReplicaRegistry::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        (store, registry)
    }

    #[tokio::test]
    async fn test_save_roundtrips_through_store() {
        let (store, registry) = setup().await;
        let slot = registry.acquire("d1").await;
        slot.apply_update(&update_inserting("hello"), 50).await.unwrap();

        save(slot.clone(), store.clone()).await;
        assert_eq!(slot.update_count().await, 0);

        // Reload the blob into a fresh doc and compare content.
        let blob = store.snapshot_of("d1").await.unwrap();
        let doc = yrs::Doc::new();
        {
            let update = Update::decode_v1(&blob).unwrap();
            let mut txn = doc.transact_mut();
            txn.apply_update(update).unwrap();
        }
        let txn = doc.transact();
        assert_eq!(txn.get_text("content").unwrap().get_string(&txn), "hello");
    }

    #[tokio::test]
    async fn test_failed_save_keeps_count_for_retry() {
        let (store, registry) = setup().await;
        let slot = registry.acquire("d1").await;
        slot.apply_update(&update_inserting("x"), 50).await.unwrap();

        store.set_fail_saves(true);
        save(slot.clone(), store.clone()).await;
        // Count survives so the next trigger retries.
        assert_eq!(slot.update_count().await, 1);

        store.set_fail_saves(false);
        save(slot.clone(), store.clone()).await;
        assert_eq!(slot.update_count().await, 0);
        assert!(!store.snapshot_of("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_saves_coalesce() {
        let (store, registry) = setup().await;
        let slot = registry.acquire("d1").await;
        slot.apply_update(&update_inserting("coalesced"), 50).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            let store: Arc<dyn MetadataStore> = store.clone();
            handles.push(tokio::spawn(save(slot, store)));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(slot.update_count().await, 0);
        assert!(!store.snapshot_of("d1").await.unwrap().is_empty());
    }
}
