//! Presence: who else is editing, and where their cursor is.
//!
//! One ephemeral row per (document, client). Rows are refreshed on every
//! cursor move and considered live while `last_seen` falls inside a sliding
//! window (30 seconds by default). [`MemoryPresenceStore`] drops rows that
//! have fallen out of the window whenever the document is queried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_core::Timestamp;
use tokio::sync::RwLock;

/// Default liveness window for presence rows.
pub const PRESENCE_WINDOW: Duration = Duration::from_secs(30);

/// One collaborator's presence row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEditor {
    pub client_id: String,
    /// Cursor offset in characters
    pub cursor_position: usize,
    /// Millis since the Unix epoch
    pub last_seen: Timestamp,
}

impl ActiveEditor {
    /// Whether the row is still live at `now` for the given window.
    pub fn is_live(&self, now: Timestamp, window: Duration) -> bool {
        self.last_seen >= now.saturating_sub(window.as_millis() as u64)
    }
}

/// Presence store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    Unavailable(String),
}

impl std::fmt::Display for PresenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceError::Unavailable(e) => write!(f, "Presence store unavailable: {e}"),
        }
    }
}

impl std::error::Error for PresenceError {}

/// Ephemeral per-client cursor and liveness records.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or replace the row for `(document_id, client_id)`.
    async fn upsert(
        &self,
        document_id: &str,
        client_id: &str,
        cursor_position: usize,
        last_seen: Timestamp,
    ) -> Result<(), PresenceError>;

    /// Every row of the document with `last_seen >= since`.
    async fn query(&self, document_id: &str, since: Timestamp)
        -> Result<Vec<ActiveEditor>, PresenceError>;

    async fn delete(&self, document_id: &str, client_id: &str) -> Result<(), PresenceError>;
}

/// In-process [`PresenceStore`].
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    rows: RwLock<HashMap<String, HashMap<String, ActiveEditor>>>,
    failing: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [`PresenceError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Row for a client regardless of age.
    pub async fn get(&self, document_id: &str, client_id: &str) -> Option<ActiveEditor> {
        self.rows
            .read()
            .await
            .get(document_id)
            .and_then(|doc| doc.get(client_id))
            .cloned()
    }

    pub async fn row_count(&self, document_id: &str) -> usize {
        self.rows
            .read()
            .await
            .get(document_id)
            .map_or(0, HashMap::len)
    }

    fn check(&self) -> Result<(), PresenceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PresenceError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(
        &self,
        document_id: &str,
        client_id: &str,
        cursor_position: usize,
        last_seen: Timestamp,
    ) -> Result<(), PresenceError> {
        self.check()?;
        let mut rows = self.rows.write().await;
        rows.entry(document_id.to_string()).or_default().insert(
            client_id.to_string(),
            ActiveEditor {
                client_id: client_id.to_string(),
                cursor_position,
                last_seen,
            },
        );
        Ok(())
    }

    async fn query(
        &self,
        document_id: &str,
        since: Timestamp,
    ) -> Result<Vec<ActiveEditor>, PresenceError> {
        self.check()?;
        let mut rows = self.rows.write().await;
        let Some(doc) = rows.get_mut(document_id) else {
            return Ok(Vec::new());
        };

        doc.retain(|_, e| e.last_seen >= since);
        let mut editors: Vec<ActiveEditor> = doc.values().cloned().collect();
        if doc.is_empty() {
            rows.remove(document_id);
        }
        editors.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(editors)
    }

    async fn delete(&self, document_id: &str, client_id: &str) -> Result<(), PresenceError> {
        self.check()?;
        let mut rows = self.rows.write().await;
        if let Some(doc) = rows.get_mut(document_id) {
            doc.remove(client_id);
            if doc.is_empty() {
                rows.remove(document_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_live_window_edges() {
        let editor = ActiveEditor {
            client_id: "bob".into(),
            cursor_position: 0,
            last_seen: 70_000,
        };
        assert!(editor.is_live(100_000, PRESENCE_WINDOW));
        assert!(!editor.is_live(100_001, PRESENCE_WINDOW));
        // Early in the epoch the window start saturates at zero.
        assert!(editor.is_live(10_000, PRESENCE_WINDOW));
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = MemoryPresenceStore::new();
        store.upsert("doc", "alice", 0, 1_000).await.unwrap();
        store.upsert("doc", "alice", 7, 2_000).await.unwrap();

        let row = store.get("doc", "alice").await.unwrap();
        assert_eq!(row.cursor_position, 7);
        assert_eq!(row.last_seen, 2_000);
        assert_eq!(store.row_count("doc").await, 1);
    }

    #[tokio::test]
    async fn test_query_filters_by_since() {
        let store = MemoryPresenceStore::new();
        store.upsert("doc", "alice", 1, 1_000).await.unwrap();
        store.upsert("doc", "bob", 2, 5_000).await.unwrap();
        store.upsert("other", "carol", 3, 9_000).await.unwrap();

        let editors = store.query("doc", 2_000).await.unwrap();
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].client_id, "bob");
    }

    #[tokio::test]
    async fn test_query_prunes_stale_rows() {
        let store = MemoryPresenceStore::new();
        store.upsert("doc", "alice", 1, 1_000).await.unwrap();
        store.upsert("doc", "bob", 2, 5_000).await.unwrap();
        store.upsert("other", "carol", 3, 1_000).await.unwrap();
        assert_eq!(store.row_count("doc").await, 2);

        store.query("doc", 2_000).await.unwrap();
        assert_eq!(store.row_count("doc").await, 1);
        assert!(store.get("doc", "alice").await.is_none());
        // Other documents are left alone.
        assert_eq!(store.row_count("other").await, 1);

        assert!(store.query("doc", 6_000).await.unwrap().is_empty());
        assert_eq!(store.row_count("doc").await, 0);
    }

    #[tokio::test]
    async fn test_delete_row() {
        let store = MemoryPresenceStore::new();
        store.upsert("doc", "alice", 0, 1_000).await.unwrap();
        store.delete("doc", "alice").await.unwrap();
        store.delete("doc", "nobody").await.unwrap();
        assert!(store.get("doc", "alice").await.is_none());
        assert_eq!(store.row_count("doc").await, 0);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryPresenceStore::new();
        store.set_failing(true);
        assert!(store.upsert("doc", "alice", 0, 0).await.is_err());
        assert!(store.query("doc", 0).await.is_err());
        assert!(store.delete("doc", "alice").await.is_err());
    }
}
