//! External metadata store interface.
//!
//! User accounts, document records, and snapshot durability live in an
//! external store behind this narrow interface. The hub only ever reads
//! users, reads documents for access resolution, and writes snapshot
//! blobs; collaborator management happens elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::access::Role;

/// A user account, as stored externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// One collaborator entry on a document record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: String,
    pub role: Role,
}

/// A document record, as stored externally.
///
/// Invariants (checked by [`DocumentRecord::validate`]): exactly one
/// collaborator carries [`Role::Owner`] and its user id equals `owner_id`;
/// user ids are unique within `collaborators`; the title is non-empty and
/// at most 255 characters. `yjs_snapshot` is the opaque full-state
/// encoding produced by the CRDT library — the only durable
/// representation of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub yjs_snapshot: Vec<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentRecord {
    /// Create a record owned by `owner_id`, with the owner as the sole
    /// collaborator and an empty snapshot.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let owner_id = owner_id.into();
        let now = unix_now();
        Self {
            id: id.into(),
            title: title.into(),
            owner_id: owner_id.clone(),
            collaborators: vec![Collaborator {
                user_id: owner_id,
                role: Role::Owner,
            }],
            yjs_snapshot: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add or replace a non-owner collaborator entry.
    pub fn with_collaborator(mut self, user_id: impl Into<String>, role: Role) -> Self {
        let user_id = user_id.into();
        self.collaborators.retain(|c| c.user_id != user_id);
        self.collaborators.push(Collaborator { user_id, role });
        self
    }

    /// The role `user_id` holds on this document, if any.
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        self.collaborators
            .iter()
            .find(|c| c.user_id == user_id)
            .map(|c| c.role)
    }

    /// Check the record invariants.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.is_empty() || self.title.len() > 255 {
            return Err(StoreError::InvalidRecord("title must be 1..=255 chars".into()));
        }
        let owners: Vec<_> = self
            .collaborators
            .iter()
            .filter(|c| c.role == Role::Owner)
            .collect();
        if owners.len() != 1 || owners[0].user_id != self.owner_id {
            return Err(StoreError::InvalidRecord(
                "exactly one owner collaborator matching ownerId required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.collaborators {
            if !seen.insert(c.user_id.as_str()) {
                return Err(StoreError::InvalidRecord(format!(
                    "duplicate collaborator {}",
                    c.user_id
                )));
            }
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Backend failure (connection loss, write refusal, …).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The narrow interface the hub consumes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Resolve a user id to its account record.
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Return the document iff `user_id` is the owner or a collaborator.
    /// `None` covers both "no access" and "no such document".
    async fn find_document_for_access(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError>;

    /// Load a document record unconditionally.
    async fn load_document(&self, document_id: &str) -> Result<DocumentRecord, StoreError>;

    /// Overwrite the document's snapshot blob.
    async fn persist_snapshot(&self, document_id: &str, blob: &[u8]) -> Result<(), StoreError>;
}

/// In-memory [`MetadataStore`] for tests and single-process deployments.
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    documents: RwLock<HashMap<String, DocumentRecord>>,
    /// When set, `persist_snapshot` fails — used to exercise the
    /// save-failure retry path.
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    /// Insert a document after checking the record invariants.
    pub async fn insert_document(&self, record: DocumentRecord) -> Result<(), StoreError> {
        record.validate()?;
        self.documents
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    /// Current snapshot blob for a document (test observability).
    pub async fn snapshot_of(&self, document_id: &str) -> Option<Vec<u8>> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|d| d.yjs_snapshot.clone())
    }

    /// Toggle snapshot-write failures.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn find_document_for_access(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(document_id)
            .filter(|d| d.role_of(user_id).is_some())
            .cloned())
    }

    async fn load_document(&self, document_id: &str) -> Result<DocumentRecord, StoreError> {
        self.documents
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))
    }

    async fn persist_snapshot(&self, document_id: &str, blob: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected save failure".into()));
        }
        let mut documents = self.documents.write().await;
        let record = documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        record.yjs_snapshot = blob.to_vec();
        record.updated_at = unix_now();
        Ok(())
    }
}
