//! Cached document snapshots.
//!
//! The snapshot is advisory: a fast-path read for joining coordinators. The
//! operation log stays authoritative.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tandem_core::Document;
use tokio::sync::RwLock;

/// Snapshot store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// `create` found an existing snapshot
    AlreadyExists(String),
    Unavailable(String),
    Backend(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::AlreadyExists(id) => write!(f, "Snapshot already exists: {id}"),
            SnapshotError::Unavailable(e) => write!(f, "Snapshot store unavailable: {e}"),
            SnapshotError::Backend(e) => write!(f, "Snapshot store error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when the document has no snapshot yet.
    async fn get(&self, document_id: &str) -> Result<Option<Document>, SnapshotError>;

    async fn create(&self, document_id: &str, initial: &Document) -> Result<(), SnapshotError>;

    async fn update(&self, document_id: &str, snapshot: &Document) -> Result<(), SnapshotError>;
}

/// In-process [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Document>>,
    failing: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one snapshot.
    pub fn with_snapshot(document_id: &str, snapshot: Document) -> Self {
        let mut snapshots = HashMap::new();
        snapshots.insert(document_id.to_string(), snapshot);
        Self {
            snapshots: RwLock::new(snapshots),
            failing: AtomicBool::new(false),
        }
    }

    /// While set, every call fails with [`SnapshotError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SnapshotError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SnapshotError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, document_id: &str) -> Result<Option<Document>, SnapshotError> {
        self.check()?;
        Ok(self.snapshots.read().await.get(document_id).cloned())
    }

    async fn create(&self, document_id: &str, initial: &Document) -> Result<(), SnapshotError> {
        self.check()?;
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(document_id) {
            return Err(SnapshotError::AlreadyExists(document_id.to_string()));
        }
        snapshots.insert(document_id.to_string(), initial.clone());
        Ok(())
    }

    async fn update(&self, document_id: &str, snapshot: &Document) -> Result<(), SnapshotError> {
        self.check()?;
        self.snapshots
            .write()
            .await
            .insert(document_id.to_string(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = MemorySnapshotStore::new();
        assert_eq!(store.get("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = MemorySnapshotStore::new();
        store.create("doc", &Document::empty()).await.unwrap();
        assert_eq!(store.get("doc").await.unwrap(), Some(Document::empty()));

        let next = Document::new("hi", 2);
        store.update("doc", &next).await.unwrap();
        assert_eq!(store.get("doc").await.unwrap(), Some(next));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = MemorySnapshotStore::with_snapshot("doc", Document::new("x", 1));
        let err = store.create("doc", &Document::empty()).await.unwrap_err();
        assert_eq!(err, SnapshotError::AlreadyExists("doc".into()));
        // Existing snapshot untouched.
        assert_eq!(store.get("doc").await.unwrap().unwrap().text, "x");
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemorySnapshotStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.get("doc").await,
            Err(SnapshotError::Unavailable(_))
        ));
    }
}
