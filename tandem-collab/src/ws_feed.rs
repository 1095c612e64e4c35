//! [`ChangeFeed`] client for a [`RelayServer`](crate::relay::RelayServer).
//!
//! One WebSocket carries every document this feed touches. The socket is
//! opened lazily and reopened on the next call after it drops; when it drops,
//! in-flight requests fail with [`FeedError::ConnectionClosed`] and every
//! live [`Subscription`] ends, which is how a coordinator learns it is
//! disconnected.
//!
//! Dropped subscriptions are noticed when the next record for their document
//! arrives; once none is left the relay is sent an `Unsubscribe`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::feed::{ChangeFeed, FeedError, Subscription};
use crate::protocol::{FeedMessage, OperationRecord};

const OUTGOING_BUFFER: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 256;

/// Routes incoming frames to whoever is waiting for them.
#[derive(Default)]
struct Router {
    pending: StdMutex<HashMap<u64, oneshot::Sender<FeedMessage>>>,
    subscribers: StdMutex<HashMap<String, Vec<mpsc::Sender<OperationRecord>>>>,
    closed: AtomicBool,
}

impl Router {
    fn register(&self, request_id: u64, tx: oneshot::Sender<FeedMessage>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id, tx);
        }
    }

    fn forget(&self, request_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request_id);
        }
    }

    /// Add a subscriber. Returns true if the document had no live ones.
    fn add_subscriber(&self, document_id: &str, tx: mpsc::Sender<OperationRecord>) -> bool {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return true;
        };
        let entry = subscribers.entry(document_id.to_string()).or_default();
        entry.retain(|s| !s.is_closed());
        let first = entry.is_empty();
        entry.push(tx);
        first
    }

    /// Live subscribers of a document. Closed ones are pruned; when none
    /// remain the document is unsubscribed through `outgoing`.
    fn live_subscribers(
        &self,
        document_id: &str,
        outgoing: &mpsc::Sender<Vec<u8>>,
    ) -> Vec<mpsc::Sender<OperationRecord>> {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return Vec::new();
        };
        let Some(entry) = subscribers.get_mut(document_id) else {
            return Vec::new();
        };
        entry.retain(|s| !s.is_closed());
        if !entry.is_empty() {
            return entry.clone();
        }

        subscribers.remove(document_id);
        // Queued under the lock so a later Subscribe is written after it.
        let frame = FeedMessage::Unsubscribe {
            document_id: document_id.to_string(),
        };
        match frame.encode() {
            Ok(bytes) => {
                if outgoing.try_send(bytes).is_err() {
                    log::debug!("Could not queue Unsubscribe for {document_id}");
                }
            }
            Err(e) => log::warn!("Failed to encode Unsubscribe: {e}"),
        }
        Vec::new()
    }

    async fn dispatch(&self, frame: FeedMessage, outgoing: &mpsc::Sender<Vec<u8>>) {
        match frame {
            FeedMessage::Operation {
                document_id,
                record,
            } => {
                for target in self.live_subscribers(&document_id, outgoing) {
                    // A dropped Subscription just stops receiving.
                    let _ = target.send(record.clone()).await;
                }
            }
            reply => {
                let Some(request_id) = reply.request_id() else {
                    log::trace!("Ignoring frame {reply:?}");
                    return;
                };
                let waiter = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&request_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => log::debug!("Reply for unknown request {request_id}"),
                }
            }
        }
    }

    /// Fail every waiter and end every subscription.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One open socket and its reader/writer tasks.
struct Connection {
    outgoing: mpsc::Sender<Vec<u8>>,
    router: Arc<Router>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    async fn open(url: &str) -> Result<Self, FeedError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_BUFFER);
        let router = Arc::new(Router::default());

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route incoming frames
        let reader_router = router.clone();
        let reader_outgoing = outgoing.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match FeedMessage::decode(&data) {
                        Ok(frame) => reader_router.dispatch(frame, &reader_outgoing).await,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Relay connection lost");
            reader_router.shutdown();
        });

        Ok(Self {
            outgoing,
            router,
            reader,
            writer,
        })
    }

    async fn send(&self, frame: FeedMessage) -> Result<(), FeedError> {
        let bytes = frame
            .encode()
            .map_err(|e| FeedError::Rejected(e.to_string()))?;
        self.outgoing
            .send(bytes)
            .await
            .map_err(|_| FeedError::ConnectionClosed)
    }

    fn is_closed(&self) -> bool {
        self.router.is_closed() || self.outgoing.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Change feed backed by a relay WebSocket.
pub struct WsFeed {
    url: String,
    request_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
    next_request: AtomicU64,
}

impl WsFeed {
    /// Feed for the relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            connection: Mutex::new(None),
            next_request: AtomicU64::new(1),
        }
    }

    /// How long to wait for an Ack or History reply (default: 5s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a socket is currently open.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Close the socket. The next call reconnects.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.router.shutdown();
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, FeedError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        log::debug!("Connecting to relay at {}", self.url);
        let conn = Arc::new(Connection::open(&self.url).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> FeedMessage + Send,
    ) -> Result<FeedMessage, FeedError> {
        let conn = self.connection().await?;
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        conn.router.register(request_id, tx);
        if let Err(e) = conn.send(build(request_id)).await {
            conn.router.forget(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FeedError::ConnectionClosed),
            Err(_) => {
                conn.router.forget(request_id);
                Err(FeedError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for WsFeed {
    async fn append(&self, document_id: &str, record: OperationRecord) -> Result<(), FeedError> {
        let document_id = document_id.to_string();
        let reply = self
            .request(move |request_id| FeedMessage::Append {
                request_id,
                document_id,
                record,
            })
            .await?;
        match reply {
            FeedMessage::Ack { .. } => Ok(()),
            FeedMessage::Nack { reason, .. } => Err(FeedError::Rejected(reason)),
            other => Err(FeedError::Unavailable(format!("unexpected reply {other:?}"))),
        }
    }

    async fn subscribe(&self, document_id: &str) -> Result<Subscription, FeedError> {
        let conn = self.connection().await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if conn.router.add_subscriber(document_id, tx) {
            conn.send(FeedMessage::Subscribe {
                document_id: document_id.to_string(),
            })
            .await?;
        }
        Ok(Subscription::new(document_id, rx))
    }

    async fn history(&self, document_id: &str) -> Result<Vec<OperationRecord>, FeedError> {
        let document_id = document_id.to_string();
        let reply = self
            .request(move |request_id| FeedMessage::FetchHistory {
                request_id,
                document_id,
            })
            .await?;
        match reply {
            FeedMessage::History { records, .. } => Ok(records),
            FeedMessage::Nack { reason, .. } => Err(FeedError::Rejected(reason)),
            other => Err(FeedError::Unavailable(format!("unexpected reply {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Operation;

    #[tokio::test]
    async fn test_unreachable_relay_is_unavailable() {
        // Nothing listens on the discard port in test environments.
        let feed = WsFeed::new("ws://127.0.0.1:9");
        assert!(!feed.is_connected().await);
        assert!(matches!(
            feed.subscribe("doc").await,
            Err(FeedError::Unavailable(_))
        ));
        let record = OperationRecord::from(&Operation::insert(0, "x", "alice", 1));
        assert!(matches!(
            feed.append("doc", record).await,
            Err(FeedError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_router_routes_replies_by_request_id() {
        let router = Router::default();
        let (tx, rx) = oneshot::channel();
        router.register(3, tx);

        let (outgoing, _out_rx) = mpsc::channel(4);
        router.dispatch(FeedMessage::Ack { request_id: 3 }, &outgoing).await;
        assert_eq!(rx.await.unwrap(), FeedMessage::Ack { request_id: 3 });

        // Unknown ids are ignored.
        router.dispatch(FeedMessage::Ack { request_id: 99 }, &outgoing).await;
    }

    #[tokio::test]
    async fn test_router_fans_out_operations() {
        let router = Router::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        assert!(router.add_subscriber("doc", tx1));
        assert!(!router.add_subscriber("doc", tx2));

        let (outgoing, mut out_rx) = mpsc::channel(4);
        let record = OperationRecord::from(&Operation::insert(0, "x", "bob", 1));
        router
            .dispatch(
                FeedMessage::Operation {
                    document_id: "doc".into(),
                    record: record.clone(),
                },
                &outgoing,
            )
            .await;

        assert_eq!(rx1.recv().await.unwrap(), record);
        assert_eq!(rx2.recv().await.unwrap(), record);
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_dropped_subscriber_unsubscribes() {
        let router = Router::default();
        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.add_subscriber("doc", tx1);
        router.add_subscriber("doc", tx2);
        let (outgoing, mut out_rx) = mpsc::channel(4);
        let frame = || FeedMessage::Operation {
            document_id: "doc".into(),
            record: OperationRecord::from(&Operation::insert(0, "x", "bob", 1)),
        };

        drop(rx1);
        router.dispatch(frame(), &outgoing).await;
        assert!(rx2.recv().await.is_some());
        assert!(out_rx.try_recv().is_err(), "one subscriber is still live");

        drop(rx2);
        router.dispatch(frame(), &outgoing).await;
        let sent = FeedMessage::decode(&out_rx.try_recv().unwrap()).unwrap();
        assert_eq!(
            sent,
            FeedMessage::Unsubscribe {
                document_id: "doc".into()
            }
        );

        // Nothing is left to unsubscribe a second time.
        router.dispatch(frame(), &outgoing).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_shutdown_ends_everything() {
        let router = Router::default();
        let (tx, rx) = oneshot::channel();
        router.register(1, tx);
        let (sub_tx, mut sub_rx) = mpsc::channel(4);
        router.add_subscriber("doc", sub_tx);

        router.shutdown();

        assert!(router.is_closed());
        assert!(rx.await.is_err());
        assert!(sub_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let router = Router::default();
        let (tx, rx) = mpsc::channel(4);
        router.add_subscriber("doc", tx);
        drop(rx);

        let (tx2, _rx2) = mpsc::channel(4);
        // The only previous subscriber is gone, so this counts as first.
        assert!(router.add_subscriber("doc", tx2));
    }
}
