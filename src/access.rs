//! Document access control.
//!
//! Role → capability matrix:
//!
//! | Role   | read | awareness | update |
//! |--------|------|-----------|--------|
//! | owner  | ✓    | ✓         | ✓      |
//! | editor | ✓    | ✓         | ✓      |
//! | viewer | ✓    | ✓         | ✗      |
//!
//! Role resolution is re-checked on join, rejoin, and on every update so
//! that mid-session role changes take effect without a reconnect.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{MetadataStore, StoreError};

/// A user's role on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Whether this role may mutate document content.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers "may user U perform action A on document D?".
pub struct AccessControl {
    store: Arc<dyn MetadataStore>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Resolve the role `user_id` holds on `document_id`.
    ///
    /// `None` means "no access" — whether because the user holds no role
    /// or because the document does not exist is deliberately not
    /// distinguishable, to prevent document-id enumeration.
    pub async fn resolve_role(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Option<Role>, StoreError> {
        let record = self
            .store
            .find_document_for_access(document_id, user_id)
            .await?;
        Ok(record.and_then(|r| r.role_of(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentRecord, MemoryStore};

    #[test]
    fn test_capability_matrix() {
        assert!(Role::Owner.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(!Role::Viewer.can_edit());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Owner).unwrap(), "\"owner\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"viewer\"").unwrap(),
            Role::Viewer
        );
    }

    #[tokio::test]
    async fn test_resolve_role_paths() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_document(
                DocumentRecord::new("d1", "Notes", "alice")
                    .with_collaborator("bob", Role::Editor)
                    .with_collaborator("carol", Role::Viewer),
            )
            .await
            .unwrap();
        let access = AccessControl::new(store);

        assert_eq!(access.resolve_role("alice", "d1").await.unwrap(), Some(Role::Owner));
        assert_eq!(access.resolve_role("bob", "d1").await.unwrap(), Some(Role::Editor));
        assert_eq!(access.resolve_role("carol", "d1").await.unwrap(), Some(Role::Viewer));
        // Stranger and nonexistent document are indistinguishable.
        assert_eq!(access.resolve_role("mallory", "d1").await.unwrap(), None);
        assert_eq!(access.resolve_role("alice", "ghost").await.unwrap(), None);
    }
}
