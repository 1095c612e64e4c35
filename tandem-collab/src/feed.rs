//! Change feed: the append-only, broadcasting operation log.
//!
//! ```text
//!  Coordinator A ──append──┐                 ┌──► Subscription (A)   echo, discarded by A
//!                          ├──► FeedRoom ────┤
//!  Coordinator B ──append──┘   (per doc)     └──► Subscription (B)
//! ```
//!
//! [`ChangeFeed`] is the seam the coordinator talks to. [`MemoryFeed`] is the
//! in-process implementation: one tokio broadcast channel per document room
//! plus, optionally, the room's full history. The relay server uses it as its
//! fan-out fabric, without history when a store keeps the log.
//!
//! A subscriber that falls more than the room capacity behind has missed
//! records for good. Its subscription ends so the consumer can resubscribe
//! and resynchronize instead of silently diverging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::OperationRecord;

/// Buffered records per subscription before the forwarder applies
/// backpressure.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Change feed errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The feed could not be reached
    Unavailable(String),
    /// The feed refused the record
    Rejected(String),
    /// No reply in time
    Timeout,
    /// Underlying connection went away
    ConnectionClosed,
    /// The feed cannot do what was asked (e.g. no history)
    Unsupported,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Unavailable(e) => write!(f, "Feed unavailable: {e}"),
            FeedError::Rejected(e) => write!(f, "Append rejected: {e}"),
            FeedError::Timeout => write!(f, "Feed request timed out"),
            FeedError::ConnectionClosed => write!(f, "Feed connection closed"),
            FeedError::Unsupported => write!(f, "Operation not supported by this feed"),
        }
    }
}

impl std::error::Error for FeedError {}

/// A live stream of records for one document.
///
/// Ends (yields `None`) when the feed drops the subscription. Dropping the
/// `Subscription` stops the forwarding task, if any.
pub struct Subscription {
    document_id: String,
    receiver: mpsc::Receiver<OperationRecord>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by some other task.
    pub fn new(document_id: impl Into<String>, receiver: mpsc::Receiver<OperationRecord>) -> Self {
        Self {
            document_id: document_id.into(),
            receiver,
            forwarder: None,
        }
    }

    /// Wrap a receiver together with the task that feeds it.
    pub fn with_forwarder(
        document_id: impl Into<String>,
        receiver: mpsc::Receiver<OperationRecord>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            receiver,
            forwarder: Some(forwarder),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Next record, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<OperationRecord> {
        self.receiver.recv().await
    }

    /// Next record if one is already buffered.
    pub fn try_recv(&mut self) -> Result<OperationRecord, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("document_id", &self.document_id)
            .finish_non_exhaustive()
    }
}

/// Durable, appendable, broadcastable operation log.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Append a record; it is then delivered to every subscriber of the
    /// document, the appender included.
    async fn append(&self, document_id: &str, record: OperationRecord) -> Result<(), FeedError>;

    /// Subscribe to every record appended to the document from now on.
    async fn subscribe(&self, document_id: &str) -> Result<Subscription, FeedError>;

    /// Every record ever appended to the document, oldest first.
    async fn history(&self, _document_id: &str) -> Result<Vec<OperationRecord>, FeedError> {
        Err(FeedError::Unsupported)
    }
}

/// Statistics for monitoring a feed room.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub records_appended: u64,
    pub records_delivered: u64,
    pub active_subscribers: usize,
}

/// One document's broadcast channel and, optionally, its log.
pub struct FeedRoom {
    sender: broadcast::Sender<Arc<OperationRecord>>,
    log: Option<RwLock<Vec<OperationRecord>>>,
    capacity: usize,
    appended: AtomicU64,
}

impl FeedRoom {
    /// `capacity` is how many records a lagging subscriber may fall behind
    /// before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, true)
    }

    /// A room that only fans out; nothing is retained.
    pub fn without_history(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    fn build(capacity: usize, keep_history: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            log: keep_history.then(|| RwLock::new(Vec::new())),
            capacity,
            appended: AtomicU64::new(0),
        }
    }

    /// Log and fan out a record. Returns how many subscribers it reached.
    pub async fn publish(&self, record: OperationRecord) -> usize {
        self.appended.fetch_add(1, Ordering::Relaxed);
        match &self.log {
            Some(log) => {
                // Hold the log lock across the send so log order == delivery order.
                let mut log = log.write().await;
                log.push(record.clone());
                self.sender.send(Arc::new(record)).unwrap_or(0)
            }
            None => self.sender.send(Arc::new(record)).unwrap_or(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OperationRecord>> {
        self.sender.subscribe()
    }

    /// The full log, or `None` for a room without history.
    pub async fn history(&self) -> Option<Vec<OperationRecord>> {
        match &self.log {
            Some(log) => Some(log.read().await.clone()),
            None => None,
        }
    }

    /// Records currently held in memory.
    pub async fn retained(&self) -> usize {
        match &self.log {
            Some(log) => log.read().await.len(),
            None => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }
}

/// Maps document ids to feed rooms.
pub struct FeedRooms {
    rooms: RwLock<HashMap<String, Arc<FeedRoom>>>,
    default_capacity: usize,
    keep_history: bool,
}

impl FeedRooms {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            keep_history: true,
        }
    }

    /// Rooms created by this map keep no log.
    pub fn without_history(default_capacity: usize) -> Self {
        Self {
            keep_history: false,
            ..Self::new(default_capacity)
        }
    }

    pub fn keeps_history(&self) -> bool {
        self.keep_history
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<FeedRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(FeedRoom::build(self.default_capacity, self.keep_history)))
            .clone()
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<FeedRoom>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

/// In-process [`ChangeFeed`].
///
/// Fault injection (`fail_next_appends`, `set_subscriptions_available`,
/// `disconnect_all`) lets callers exercise retry and reconnection paths.
pub struct MemoryFeed {
    rooms: FeedRooms,
    failing_appends: AtomicU32,
    subscriptions_available: AtomicBool,
    append_attempts: AtomicU64,
    delivered: Arc<AtomicU64>,
    forwarders: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
}

impl MemoryFeed {
    pub fn new(capacity: usize) -> Self {
        Self::with_rooms(FeedRooms::new(capacity))
    }

    /// A fan-out-only feed: `history` reports [`FeedError::Unsupported`].
    pub fn without_history(capacity: usize) -> Self {
        Self::with_rooms(FeedRooms::without_history(capacity))
    }

    fn with_rooms(rooms: FeedRooms) -> Self {
        Self {
            rooms,
            failing_appends: AtomicU32::new(0),
            subscriptions_available: AtomicBool::new(true),
            append_attempts: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
            forwarders: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` appends fail with [`FeedError::Unavailable`].
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// When false, `subscribe` fails with [`FeedError::Unavailable`].
    pub fn set_subscriptions_available(&self, available: bool) {
        self.subscriptions_available.store(available, Ordering::SeqCst);
    }

    /// End every live subscription, as a dropped connection would.
    pub fn disconnect_all(&self) {
        if let Ok(mut forwarders) = self.forwarders.lock() {
            for handle in forwarders.drain(..) {
                handle.abort();
            }
        }
    }

    /// Appends attempted so far, failed ones included.
    pub fn append_attempts(&self) -> u64 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    pub async fn stats(&self, document_id: &str) -> FeedStats {
        match self.rooms.get(document_id).await {
            Some(room) => FeedStats {
                records_appended: room.appended(),
                records_delivered: self.delivered.load(Ordering::Relaxed),
                active_subscribers: room.subscriber_count(),
            },
            None => FeedStats::default(),
        }
    }

    pub fn rooms(&self) -> &FeedRooms {
        &self.rooms
    }
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn append(&self, document_id: &str, record: OperationRecord) -> Result<(), FeedError> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FeedError::Unavailable("injected append failure".into()));
        }

        let room = self.rooms.get_or_create(document_id).await;
        let reached = room.publish(record).await;
        log::trace!("Appended record to {document_id}; {reached} subscribers");
        Ok(())
    }

    async fn subscribe(&self, document_id: &str) -> Result<Subscription, FeedError> {
        if !self.subscriptions_available.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable("subscriptions disabled".into()));
        }

        let room = self.rooms.get_or_create(document_id).await;
        let mut broadcast_rx = room.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let delivered = self.delivered.clone();
        let doc = document_id.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(record) => {
                        if tx.send((*record).clone()).await.is_err() {
                            break;
                        }
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {doc} lagged by {n} records; ending subscription");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.retain(|h| !h.is_finished());
            forwarders.push(forwarder.abort_handle());
        }

        Ok(Subscription::with_forwarder(document_id, rx, forwarder))
    }

    async fn history(&self, document_id: &str) -> Result<Vec<OperationRecord>, FeedError> {
        if !self.rooms.keeps_history() {
            return Err(FeedError::Unsupported);
        }
        match self.rooms.get(document_id).await {
            Some(room) => room.history().await.ok_or(FeedError::Unsupported),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Operation;
    use tokio::time::{timeout, Duration};

    fn record(client: &str, pos: usize) -> OperationRecord {
        OperationRecord::from(&Operation::insert(pos, "x", client, 1))
    }

    #[tokio::test]
    async fn test_subscriber_receives_own_append() {
        let feed = MemoryFeed::default();
        let mut sub = feed.subscribe("doc").await.unwrap();

        feed.append("doc", record("alice", 0)).await.unwrap();

        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got.client_id, "alice");
    }

    #[tokio::test]
    async fn test_fan_out_preserves_publish_order() {
        let feed = MemoryFeed::default();
        let mut sub1 = feed.subscribe("doc").await.unwrap();
        let mut sub2 = feed.subscribe("doc").await.unwrap();

        for i in 0..5 {
            feed.append("doc", record("alice", i)).await.unwrap();
        }

        for sub in [&mut sub1, &mut sub2] {
            for i in 0..5 {
                let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
                assert_eq!(got.position, i as i64);
            }
        }
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let feed = MemoryFeed::default();
        let mut sub = feed.subscribe("doc-1").await.unwrap();

        feed.append("doc-2", record("alice", 0)).await.unwrap();

        let result = timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(result.is_err(), "doc-1 must not see doc-2 records");
        assert_eq!(feed.rooms().room_count().await, 2);
    }

    #[tokio::test]
    async fn test_history_is_append_order() {
        let feed = MemoryFeed::default();
        feed.append("doc", record("alice", 0)).await.unwrap();
        feed.append("doc", record("bob", 1)).await.unwrap();

        let history = feed.history("doc").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].client_id, "alice");
        assert_eq!(history[1].client_id, "bob");
        assert!(feed.history("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let feed = MemoryFeed::default();
        feed.fail_next_appends(2);

        assert!(feed.append("doc", record("a", 0)).await.is_err());
        assert!(feed.append("doc", record("a", 0)).await.is_err());
        assert!(feed.append("doc", record("a", 0)).await.is_ok());
        assert_eq!(feed.append_attempts(), 3);
        assert_eq!(feed.history("doc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscriptions_unavailable() {
        let feed = MemoryFeed::default();
        feed.set_subscriptions_available(false);
        assert!(matches!(
            feed.subscribe("doc").await,
            Err(FeedError::Unavailable(_))
        ));
        feed.set_subscriptions_available(true);
        assert!(feed.subscribe("doc").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_subscriptions() {
        let feed = MemoryFeed::default();
        let mut sub = feed.subscribe("doc").await.unwrap();

        feed.disconnect_all();

        let end = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_ended() {
        let feed = MemoryFeed::new(2);
        let mut sub = feed.subscribe("doc").await.unwrap();

        // Far more than the subscription buffer plus the room capacity.
        for i in 0..400 {
            feed.append("doc", record("alice", i)).await.unwrap();
        }

        let mut received = 0;
        while timeout(Duration::from_secs(1), sub.recv()).await.unwrap().is_some() {
            received += 1;
        }
        assert!(received < 400);
        assert_eq!(feed.history("doc").await.unwrap().len(), 400);
    }

    #[tokio::test]
    async fn test_feed_without_history_retains_nothing() {
        let feed = MemoryFeed::without_history(16);
        let mut sub = feed.subscribe("doc").await.unwrap();

        feed.append("doc", record("alice", 0)).await.unwrap();
        feed.append("doc", record("bob", 1)).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().client_id, "alice");
        assert_eq!(sub.recv().await.unwrap().client_id, "bob");
        let room = feed.rooms().get("doc").await.unwrap();
        assert_eq!(room.appended(), 2);
        assert_eq!(room.retained().await, 0);
        assert!(room.history().await.is_none());
        assert_eq!(feed.history("doc").await, Err(FeedError::Unsupported));
    }

    #[tokio::test]
    async fn test_stats() {
        let feed = MemoryFeed::default();
        let _sub = feed.subscribe("doc").await.unwrap();
        feed.append("doc", record("a", 0)).await.unwrap();

        let stats = feed.stats("doc").await;
        assert_eq!(stats.records_appended, 1);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_room_get_or_create_returns_same_room() {
        let rooms = FeedRooms::new(16);
        let a = rooms.get_or_create("doc").await;
        let b = rooms.get_or_create("doc").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.capacity(), 16);
        assert_eq!(rooms.active_documents().await, vec!["doc".to_string()]);
    }
}
