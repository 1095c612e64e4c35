//! WebSocket relay: a change feed shared over the network.
//!
//! ```text
//! WsFeed A ──┐                                      ┌──► WsFeed A   (own echo)
//!            ├── Append ── validate ── OperationStore ── FeedRoom ──┤
//! WsFeed B ──┘                      (optional, RocksDB)            └──► WsFeed B
//! ```
//!
//! Each connection may subscribe to any number of documents. Appends are
//! validated, persisted when a store is configured, then broadcast to every
//! subscriber of the document, the appender included, and acknowledged.
//! History comes from the store when one is configured, and the in-memory
//! feed then keeps no copy of the log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::feed::{ChangeFeed, MemoryFeed};
use crate::protocol::{FeedMessage, OperationRecord};
use crate::storage::{OperationStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Records a slow subscriber may fall behind per document
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 1024,
            storage_path: None,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub appended_records: u64,
    pub rejected_appends: u64,
    pub persisted_records: u64,
}

/// State shared by every connection.
struct RelayShared {
    feed: MemoryFeed,
    store: Option<Arc<OperationStore>>,
    stats: RwLock<RelayStats>,
    /// Keeps persisted order and broadcast order identical.
    append_lock: Mutex<()>,
}

impl RelayShared {
    async fn append(&self, document_id: &str, record: OperationRecord) -> Result<(), String> {
        if let Err(e) = record.to_operation() {
            self.stats.write().await.rejected_appends += 1;
            return Err(e.to_string());
        }

        let _guard = self.append_lock.lock().await;

        if let Some(store) = &self.store {
            if let Err(e) = store.append_operation(document_id, &record) {
                log::error!("Failed to persist record for {document_id}: {e}");
                self.stats.write().await.rejected_appends += 1;
                return Err(e.to_string());
            }
            self.stats.write().await.persisted_records += 1;
        }

        self.feed
            .append(document_id, record)
            .await
            .map_err(|e| e.to_string())?;
        self.stats.write().await.appended_records += 1;
        Ok(())
    }

    async fn history(&self, document_id: &str) -> Result<Vec<OperationRecord>, String> {
        match &self.store {
            Some(store) => store.history(document_id).map_err(|e| e.to_string()),
            None => self
                .feed
                .history(document_id)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    shared: Arc<RelayShared>,
}

impl RelayServer {
    /// Create a relay, opening the store if a storage path is configured.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(OperationStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(RelayConfig::default(), None)
    }

    fn with_store(config: RelayConfig, store: Option<Arc<OperationStore>>) -> Self {
        // With a store the log lives on disk; the feed only fans out.
        let feed = match store {
            Some(_) => MemoryFeed::without_history(config.broadcast_capacity),
            None => MemoryFeed::new(config.broadcast_capacity),
        };
        let shared = RelayShared {
            feed,
            store,
            stats: RwLock::new(RelayStats::default()),
            append_lock: Mutex::new(()),
        };
        Self {
            config,
            shared: Arc::new(shared),
        }
    }

    /// Report what the store already holds. Returns the number of documents.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let store = match &self.shared.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let documents = store.list_documents()?;
        for document_id in &documents {
            let count = store.operation_count(document_id)?;
            log::info!("Document {document_id}: {count} persisted operations");
        }
        Ok(documents.len())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover()?;
        if recovered > 0 {
            log::info!("Serving {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<RelayShared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Subscription forwarders all feed this connection's outbound channel.
        let (forward_tx, mut forward_rx) = mpsc::channel::<(String, OperationRecord)>(256);
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                shared.stats.write().await.total_frames += 1;
                                let frame = match FeedMessage::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let reply = Self::handle_frame(
                                    &shared,
                                    frame,
                                    &mut forwarders,
                                    &forward_tx,
                                )
                                .await;
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    Some((document_id, record)) = forward_rx.recv() => {
                        let frame = FeedMessage::Operation { document_id, record };
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (_, forwarder) in forwarders.drain() {
            forwarder.abort();
        }
        shared.stats.write().await.active_connections -= 1;

        result
    }

    /// Handle one client frame; returns the reply, if any.
    async fn handle_frame(
        shared: &Arc<RelayShared>,
        frame: FeedMessage,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
        forward_tx: &mpsc::Sender<(String, OperationRecord)>,
    ) -> Option<FeedMessage> {
        match frame {
            FeedMessage::Subscribe { document_id } => {
                if forwarders.contains_key(&document_id) {
                    return None;
                }
                let mut subscription = match shared.feed.subscribe(&document_id).await {
                    Ok(sub) => sub,
                    Err(e) => {
                        log::error!("Subscribe to {document_id} failed: {e}");
                        return None;
                    }
                };
                let tx = forward_tx.clone();
                let doc = document_id.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(record) = subscription.recv().await {
                        if tx.send((doc.clone(), record)).await.is_err() {
                            break;
                        }
                    }
                });
                log::debug!("Subscribed connection to {document_id}");
                forwarders.insert(document_id, forwarder);
                None
            }

            FeedMessage::Unsubscribe { document_id } => {
                if let Some(forwarder) = forwarders.remove(&document_id) {
                    forwarder.abort();
                }
                None
            }

            FeedMessage::Append {
                request_id,
                document_id,
                record,
            } => match shared.append(&document_id, record).await {
                Ok(()) => Some(FeedMessage::Ack { request_id }),
                Err(reason) => {
                    log::warn!("Rejected append {request_id} to {document_id}: {reason}");
                    Some(FeedMessage::Nack { request_id, reason })
                }
            },

            FeedMessage::FetchHistory {
                request_id,
                document_id,
            } => match shared.history(&document_id).await {
                Ok(records) => Some(FeedMessage::History {
                    request_id,
                    records,
                }),
                Err(reason) => Some(FeedMessage::Nack { request_id, reason }),
            },

            other => {
                log::debug!("Unhandled frame: {other:?}");
                None
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The in-process feed behind the relay.
    pub fn feed(&self) -> &MemoryFeed {
        &self.shared.feed
    }

    /// The persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<OperationStore>> {
        self.shared.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Operation;

    fn record(client: &str) -> OperationRecord {
        OperationRecord::from(&Operation::insert(0, "x", client, 1))
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 1024);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_relay_creation() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
        assert!(relay.store().is_none());
        assert_eq!(relay.recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayServer::new(RelayConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: Some(dir.path().join("db")),
            ..RelayConfig::default()
        })
        .unwrap();
        assert!(relay.store().is_some());
    }

    #[tokio::test]
    async fn test_append_persists_then_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayServer::new(RelayConfig {
            storage_path: Some(dir.path().join("db")),
            ..RelayConfig::default()
        })
        .unwrap();
        let mut sub = relay.feed().subscribe("doc").await.unwrap();

        relay.shared.append("doc", record("alice")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().client_id, "alice");
        assert_eq!(relay.store().unwrap().history("doc").unwrap().len(), 1);

        let stats = relay.stats().await;
        assert_eq!(stats.appended_records, 1);
        assert_eq!(stats.persisted_records, 1);
    }

    #[tokio::test]
    async fn test_relay_with_storage_keeps_no_memory_log() {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayServer::new(RelayConfig {
            storage_path: Some(dir.path().join("db")),
            ..RelayConfig::default()
        })
        .unwrap();

        for client in ["alice", "bob", "carol"] {
            relay.shared.append("doc", record(client)).await.unwrap();
        }

        let room = relay.feed().rooms().get("doc").await.unwrap();
        assert_eq!(room.appended(), 3);
        assert_eq!(room.retained().await, 0);
        assert_eq!(relay.shared.history("doc").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_append_rejected() {
        let relay = RelayServer::with_defaults();
        let mut bad = record("alice");
        bad.kind = "move".into();

        assert!(relay.shared.append("doc", bad).await.is_err());
        assert!(relay.feed().history("doc").await.unwrap().is_empty());
        assert_eq!(relay.stats().await.rejected_appends, 1);
    }

    #[tokio::test]
    async fn test_handle_frame_replies() {
        let relay = RelayServer::with_defaults();
        let (tx, _rx) = mpsc::channel(8);
        let mut forwarders = HashMap::new();

        let reply = RelayServer::handle_frame(
            &relay.shared,
            FeedMessage::Append {
                request_id: 4,
                document_id: "doc".into(),
                record: record("alice"),
            },
            &mut forwarders,
            &tx,
        )
        .await;
        assert_eq!(reply, Some(FeedMessage::Ack { request_id: 4 }));

        let reply = RelayServer::handle_frame(
            &relay.shared,
            FeedMessage::FetchHistory {
                request_id: 5,
                document_id: "doc".into(),
            },
            &mut forwarders,
            &tx,
        )
        .await;
        match reply {
            Some(FeedMessage::History { request_id, records }) => {
                assert_eq!(request_id, 5);
                assert_eq!(records.len(), 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_forwards_records() {
        let relay = RelayServer::with_defaults();
        let (tx, mut rx) = mpsc::channel(8);
        let mut forwarders = HashMap::new();

        let reply = RelayServer::handle_frame(
            &relay.shared,
            FeedMessage::Subscribe {
                document_id: "doc".into(),
            },
            &mut forwarders,
            &tx,
        )
        .await;
        assert!(reply.is_none());
        assert_eq!(forwarders.len(), 1);

        relay.shared.append("doc", record("bob")).await.unwrap();
        let (doc, rec) = rx.recv().await.unwrap();
        assert_eq!(doc, "doc");
        assert_eq!(rec.client_id, "bob");

        RelayServer::handle_frame(
            &relay.shared,
            FeedMessage::Unsubscribe {
                document_id: "doc".into(),
            },
            &mut forwarders,
            &tx,
        )
        .await;
        assert!(forwarders.is_empty());
    }
}
