//! Background sender: appends local operations to the change feed in order.
//!
//! The coordinator hands each optimistically-applied operation to the sender
//! and keeps going. The sender works through them strictly one at a time,
//! retrying per the [`RetryPolicy`], then best-effort refreshes the cached
//! snapshot and reports a [`SendOutcome`] back.

use std::sync::Arc;

use tandem_core::{Document, Operation};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::feed::{ChangeFeed, FeedError};
use crate::protocol::OperationRecord;
use crate::retry::{retry_with_policy, RetryPolicy, Sleeper};
use crate::snapshot::SnapshotStore;

/// One local operation waiting to be appended.
#[derive(Debug, Clone)]
pub(crate) struct OutboundOperation {
    pub seq: u64,
    pub operation: Operation,
}

/// What happened to an [`OutboundOperation`].
#[derive(Debug, Clone)]
pub(crate) enum SendOutcome {
    Acknowledged { seq: u64 },
    Exhausted {
        seq: u64,
        attempts: u32,
        error: FeedError,
    },
}

pub(crate) struct OperationSender {
    tx: mpsc::UnboundedSender<OutboundOperation>,
    task: JoinHandle<()>,
}

impl OperationSender {
    /// Spawn the sender task for one document.
    pub fn spawn(
        document_id: String,
        feed: Arc<dyn ChangeFeed>,
        snapshots: Arc<dyn SnapshotStore>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> (Self, mpsc::UnboundedReceiver<SendOutcome>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundOperation>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let outcome = send_one(
                    &document_id,
                    feed.as_ref(),
                    snapshots.as_ref(),
                    &policy,
                    sleeper.as_ref(),
                    outbound,
                )
                .await;
                // The coordinator may have closed; keep sending what was queued.
                if outcome_tx.send(outcome).is_err() {
                    log::trace!("Outcome for {document_id} discarded");
                }
            }
            log::debug!("Sender for {document_id} stopped");
        });

        (Self { tx, task }, outcome_rx)
    }

    /// Queue an operation. Returns false once the sender has stopped.
    pub fn submit(&self, seq: u64, operation: Operation) -> bool {
        self.tx.send(OutboundOperation { seq, operation }).is_ok()
    }

    /// Stop accepting work; already-queued operations are still sent.
    pub fn shutdown(self) -> JoinHandle<()> {
        drop(self.tx);
        self.task
    }
}

async fn send_one(
    document_id: &str,
    feed: &dyn ChangeFeed,
    snapshots: &dyn SnapshotStore,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    outbound: OutboundOperation,
) -> SendOutcome {
    let OutboundOperation { seq, operation } = outbound;
    let record = OperationRecord::from(&operation);

    let appended = retry_with_policy(policy, sleeper, |_| {
        let record = record.clone();
        async move { feed.append(document_id, record).await }
    })
    .await;

    match appended {
        Ok(()) => {
            refresh_snapshot(document_id, snapshots, &operation).await;
            SendOutcome::Acknowledged { seq }
        }
        Err(e) => {
            log::warn!(
                "Dropping {operation} for {document_id} after {} attempts: {}",
                e.attempts,
                e.last_error
            );
            SendOutcome::Exhausted {
                seq,
                attempts: e.attempts,
                error: e.last_error,
            }
        }
    }
}

/// Read-modify-write of the cached snapshot. Not transactional: concurrent
/// senders may overwrite each other.
async fn refresh_snapshot(document_id: &str, snapshots: &dyn SnapshotStore, op: &Operation) {
    let mut snapshot = match snapshots.get(document_id).await {
        Ok(found) => found.unwrap_or_else(Document::empty),
        Err(e) => {
            log::error!("Snapshot read failed for {document_id}: {e}");
            return;
        }
    };
    snapshot.apply(op);
    if let Err(e) = snapshots.update(document_id, &snapshot).await {
        log::error!("Snapshot update failed for {document_id}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::retry::RecordingSleeper;
    use crate::snapshot::MemorySnapshotStore;
    use std::time::Duration;

    fn spawn_sender(
        feed: Arc<MemoryFeed>,
        snapshots: Arc<MemorySnapshotStore>,
        sleeper: Arc<RecordingSleeper>,
    ) -> (OperationSender, mpsc::UnboundedReceiver<SendOutcome>) {
        OperationSender::spawn(
            "doc".into(),
            feed,
            snapshots,
            RetryPolicy::default(),
            sleeper,
        )
    }

    #[tokio::test]
    async fn test_sends_in_order_and_refreshes_snapshot() {
        let feed = Arc::new(MemoryFeed::default());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let (sender, mut outcomes) =
            spawn_sender(feed.clone(), snapshots.clone(), Arc::new(RecordingSleeper::new()));

        assert!(sender.submit(1, Operation::insert(0, "Hello", "alice", 1)));
        assert!(sender.submit(2, Operation::insert(5, "!", "alice", 2)));

        for expected in [1, 2] {
            match outcomes.recv().await.unwrap() {
                SendOutcome::Acknowledged { seq } => assert_eq!(seq, expected),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        let history = feed.history("doc").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content.as_deref(), Some("Hello"));

        let snapshot = snapshots.get("doc").await.unwrap().unwrap();
        assert_eq!(snapshot, Document::new("Hello!", 2));
    }

    #[tokio::test]
    async fn test_exhaustion_after_three_attempts() {
        let feed = Arc::new(MemoryFeed::default());
        feed.fail_next_appends(3);
        let sleeper = Arc::new(RecordingSleeper::new());
        let (sender, mut outcomes) =
            spawn_sender(feed.clone(), Arc::new(MemorySnapshotStore::new()), sleeper.clone());

        sender.submit(1, Operation::insert(0, "x", "alice", 1));

        match outcomes.recv().await.unwrap() {
            SendOutcome::Exhausted { seq, attempts, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(feed.append_attempts(), 3);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(feed.history("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_does_not_block_ack() {
        let feed = Arc::new(MemoryFeed::default());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        snapshots.set_failing(true);
        let (sender, mut outcomes) =
            spawn_sender(feed, snapshots, Arc::new(RecordingSleeper::new()));

        sender.submit(9, Operation::insert(0, "x", "alice", 1));
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            SendOutcome::Acknowledged { seq: 9 }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let feed = Arc::new(MemoryFeed::default());
        let (sender, mut outcomes) = spawn_sender(
            feed.clone(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(RecordingSleeper::new()),
        );

        sender.submit(1, Operation::insert(0, "a", "alice", 1));
        sender.submit(2, Operation::insert(1, "b", "alice", 2));
        sender.shutdown().await.unwrap();

        assert!(outcomes.recv().await.is_some());
        assert!(outcomes.recv().await.is_some());
        assert!(outcomes.recv().await.is_none());
        assert_eq!(feed.history("doc").await.unwrap().len(), 2);
    }
}
