//! Per-client collaborative document coordinator.
//!
//! ```text
//!  local edit ──► generate_operations ──► apply (optimistic) ──► PendingQueue ──► OperationSender ──► ChangeFeed
//!                                                                    │                  │
//!                                                                    │ rebase through   │ SendOutcome
//!                                                                    ▼                  ▼
//!  ChangeFeed ──► Subscription ──► handle_remote_operation ──► apply ──► CoordinatorEvent
//! ```
//!
//! State moves `Uninitialized → Loading → {Connected | Disconnected} → Closed`.
//! Every failure below the coordinator (feed, presence, snapshot) is logged
//! and absorbed: local editing keeps working whatever the backends do.
//!
//! The coordinator is driven through `&mut self`; there is no internal
//! locking. Sending runs on a background task so edits never wait on the
//! network, and its results come back through [`Coordinator::next_incoming`]
//! or [`Coordinator::process_incoming`].
//!
//! A local operation stays pending, and keeps shifting incoming remote
//! operations, until its own echo arrives on the subscription. Records
//! after the echo are assumed to come from clients that had it applied.
//! A concurrent peer whose append lands after ours but was computed before
//! it saw our operation breaks that assumption and is applied un-rebased;
//! there is no base revision to detect it (see the open question on
//! convergence under reordering in DESIGN.md). An Ack alone only clears an operation when no echo is coming: there is
//! no subscription, or the operation was sent before the current one began.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::{generate_operations, rebase, Document, Operation, OperationError, TieBreak};
use tokio::sync::mpsc;

use crate::clock::{Clock, IdGenerator, SystemClock, UuidIds};
use crate::feed::{ChangeFeed, FeedError, Subscription};
use crate::pending::PendingQueue;
use crate::presence::{ActiveEditor, PresenceStore, PRESENCE_WINDOW};
use crate::protocol::OperationRecord;
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::sender::{OperationSender, SendOutcome};
use crate::snapshot::{SnapshotError, SnapshotStore};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Presence rows older than this are not active (default: 30s)
    pub presence_window: Duration,
    /// Send retry policy (default: 3 attempts, 1s linear backoff)
    pub retry: RetryPolicy,
    /// Same-position insert ordering (default: remote first)
    pub tie_break: TieBreak,
    /// Rebuild the buffer from the feed's history on init instead of
    /// trusting the cached snapshot (default: false)
    pub replay_log_on_init: bool,
    /// Buffered events before new ones are dropped (default: 256)
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            presence_window: PRESENCE_WINDOW,
            retry: RetryPolicy::default(),
            tie_break: TieBreak::RemoteFirst,
            replay_log_on_init: false,
            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    /// Short backoff and a deep event buffer.
    pub fn for_testing() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
            event_capacity: 4096,
            ..Default::default()
        }
    }
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Loading,
    /// Subscribed to the change feed
    Connected,
    /// Editing locally; no feed subscription
    Disconnected,
    Closed,
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// The buffer changed because of a loaded snapshot or a remote operation
    ContentChanged { text: String, version: u64 },
    /// The set of other active editors changed
    ActiveEditorsChanged(Vec<ActiveEditor>),
    ConnectionChanged(ConnectionState),
    /// A local operation was given up on after exhausting its retries
    OperationDropped {
        operation: Operation,
        attempts: u32,
        reason: String,
    },
}

/// What [`Coordinator::handle_remote_operation`] did with an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Rebased and applied; carries the operation as applied
    Applied(Operation),
    /// Our own operation coming back; discarded
    EchoSuppressed,
    /// Invalidated while rebasing through pending operations; dropped
    Conflicted,
    /// Malformed record; nothing changed
    Rejected(OperationError),
    /// The coordinator is closed
    Ignored,
}

/// External collaborators.
#[derive(Clone)]
pub struct Backends {
    pub feed: Arc<dyn ChangeFeed>,
    pub presence: Arc<dyn PresenceStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl Backends {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        presence: Arc<dyn PresenceStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            feed,
            presence,
            snapshots,
        }
    }
}

pub struct CoordinatorBuilder {
    document_id: String,
    backends: Backends,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sleeper: Arc<dyn Sleeper>,
    client_id: Option<String>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Use a fixed client id instead of generating one.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn build(self) -> Coordinator {
        let client_id = self.client_id.unwrap_or_else(|| self.ids.generate());
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity.max(1));
        Coordinator {
            document_id: self.document_id,
            client_id,
            config: self.config,
            backends: self.backends,
            clock: self.clock,
            sleeper: self.sleeper,
            state: ConnectionState::Uninitialized,
            document: Document::empty(),
            cursor_position: 0,
            pending: PendingQueue::new(),
            active_editors: Vec::new(),
            subscription: None,
            subscribed_after: 0,
            sender: None,
            outcomes: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }
}

/// One client's view of one shared document.
pub struct Coordinator {
    document_id: String,
    client_id: String,
    config: CoordinatorConfig,
    backends: Backends,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,

    state: ConnectionState,
    /// Local buffer and version counter
    document: Document,
    cursor_position: usize,
    pending: PendingQueue,
    active_editors: Vec<ActiveEditor>,

    subscription: Option<Subscription>,
    /// Last pending seq submitted before the current subscription began
    subscribed_after: u64,
    sender: Option<OperationSender>,
    outcomes: Option<mpsc::UnboundedReceiver<SendOutcome>>,

    event_tx: mpsc::Sender<CoordinatorEvent>,
    event_rx: Option<mpsc::Receiver<CoordinatorEvent>>,
}

enum Incoming {
    Remote(Option<OperationRecord>),
    Outcome(Option<SendOutcome>),
}

impl Coordinator {
    /// Start building a coordinator for `document_id`.
    ///
    /// Defaults: system clock, random UUID client id, real sleeps.
    pub fn builder(document_id: impl Into<String>, backends: Backends) -> CoordinatorBuilder {
        CoordinatorBuilder {
            document_id: document_id.into(),
            backends,
            config: CoordinatorConfig::default(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIds),
            sleeper: Arc::new(TokioSleeper),
            client_id: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CoordinatorEvent>> {
        self.event_rx.take()
    }

    /// Load the document, start sending, subscribe and announce presence.
    ///
    /// Never fails: a missing feed leaves the coordinator `Disconnected` with
    /// local editing available.
    pub async fn init(&mut self) {
        if self.state != ConnectionState::Uninitialized {
            log::warn!("init called on {} in state {:?}", self.document_id, self.state);
            return;
        }
        self.set_state(ConnectionState::Loading);

        self.load_document().await;
        if self.config.replay_log_on_init {
            self.replay_log().await;
        }
        self.emit(CoordinatorEvent::ContentChanged {
            text: self.document.text.clone(),
            version: self.document.version,
        });

        let (sender, outcomes) = OperationSender::spawn(
            self.document_id.clone(),
            self.backends.feed.clone(),
            self.backends.snapshots.clone(),
            self.config.retry,
            self.sleeper.clone(),
        );
        self.sender = Some(sender);
        self.outcomes = Some(outcomes);

        self.connect().await;
        self.join_as_active_editor().await;
        self.load_active_editors().await;

        log::info!(
            "Coordinator {} ready on {} (v{}, {:?})",
            self.client_id,
            self.document_id,
            self.document.version,
            self.state
        );
    }

    async fn load_document(&mut self) {
        let snapshots = &self.backends.snapshots;
        match snapshots.get(&self.document_id).await {
            Ok(Some(snapshot)) => {
                log::debug!("Loaded snapshot of {} at v{}", self.document_id, snapshot.version);
                self.document = snapshot;
            }
            Ok(None) => {
                let initial = Document::empty();
                match snapshots.create(&self.document_id, &initial).await {
                    Ok(()) => log::debug!("Created empty snapshot for {}", self.document_id),
                    Err(SnapshotError::AlreadyExists(_)) => {
                        // Another client created it between our get and create.
                        if let Ok(Some(snapshot)) = snapshots.get(&self.document_id).await {
                            self.document = snapshot;
                            return;
                        }
                    }
                    Err(e) => log::error!("Could not create snapshot for {}: {e}", self.document_id),
                }
                self.document = initial;
            }
            Err(e) => {
                log::error!("Could not load snapshot for {}: {e}", self.document_id);
                self.document = Document::empty();
            }
        }
    }

    /// Rebuild the buffer from the feed's full history and write the result
    /// back to the snapshot cache.
    async fn replay_log(&mut self) {
        let records = match self.backends.feed.history(&self.document_id).await {
            Ok(records) => records,
            Err(FeedError::Unsupported) => {
                log::debug!("Feed has no history; keeping snapshot of {}", self.document_id);
                return;
            }
            Err(e) => {
                log::warn!("History unavailable for {}: {e}", self.document_id);
                return;
            }
        };

        let mut rebuilt = Document::empty();
        for record in &records {
            match record.to_operation() {
                Ok(op) => rebuilt.apply(&op),
                Err(e) => log::warn!("Skipping malformed record in {}: {e}", self.document_id),
            }
        }

        if rebuilt != self.document {
            log::info!(
                "Replayed {} records for {}; snapshot was stale (v{} -> v{})",
                records.len(),
                self.document_id,
                self.document.version,
                rebuilt.version
            );
            if let Err(e) = self.backends.snapshots.update(&self.document_id, &rebuilt).await {
                log::error!("Could not repair snapshot for {}: {e}", self.document_id);
            }
            self.document = rebuilt;
        }
    }

    async fn connect(&mut self) {
        match self.backends.feed.subscribe(&self.document_id).await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.subscribed_after = self.pending.last_seq();
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                log::warn!("Subscription to {} failed: {e}", self.document_id);
                self.subscription = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Re-attempt the feed subscription if currently disconnected.
    pub async fn check_connection_health(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Disconnected {
            log::debug!("Reconnecting {} to {}", self.client_id, self.document_id);
            self.connect().await;
        }
        self.state
    }

    /// Apply a local edit.
    ///
    /// `new_text` is the whole buffer after the edit. Returns the operations
    /// generated, already applied locally and queued for sending. Identical
    /// text is a cursor move and only updates presence.
    pub async fn handle_local_change(
        &mut self,
        new_text: &str,
        cursor_position: usize,
    ) -> Vec<Operation> {
        if matches!(
            self.state,
            ConnectionState::Uninitialized | ConnectionState::Closed
        ) {
            log::warn!("Local change ignored in state {:?}", self.state);
            return Vec::new();
        }

        if new_text == self.document.text {
            self.update_cursor_position(cursor_position).await;
            return Vec::new();
        }

        let version = self.document.version + 1;
        let now = self.clock.now();
        let ops: Vec<Operation> =
            generate_operations(&self.document.text, new_text, &self.client_id, version)
                .into_iter()
                .map(|op| op.with_created_at(now))
                .collect();

        for op in &ops {
            self.document.apply(op);
            let seq = self.pending.push(op.clone());
            self.send_operation(seq, op.clone());
        }

        self.update_cursor_position(cursor_position).await;
        ops
    }

    fn send_operation(&mut self, seq: u64, op: Operation) {
        let submitted = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.submit(seq, op));
        if !submitted {
            log::warn!("Sender unavailable; operation {seq} stays pending");
        }
    }

    /// Integrate an operation received from the change feed.
    pub fn handle_remote_operation(&mut self, op: Operation) -> RemoteOutcome {
        if self.state == ConnectionState::Closed {
            return RemoteOutcome::Ignored;
        }
        if op.origin_client_id() == self.client_id {
            match self.pending.remove_echo(&op) {
                Some(_) => log::trace!("Echo confirmed {op}"),
                None => log::trace!("Suppressed echo of {op}"),
            }
            return RemoteOutcome::EchoSuppressed;
        }

        let rebased = match rebase(&op, self.pending.operations(), self.config.tie_break) {
            Some(rebased) if !rebased.is_noop() => rebased,
            _ => {
                log::debug!(
                    "Dropped {op}: invalidated by {} pending operations",
                    self.pending.len()
                );
                return RemoteOutcome::Conflicted;
            }
        };

        self.document.apply(&rebased);
        self.emit(CoordinatorEvent::ContentChanged {
            text: self.document.text.clone(),
            version: self.document.version,
        });
        RemoteOutcome::Applied(rebased)
    }

    /// Validate a feed record, then [`handle_remote_operation`](Self::handle_remote_operation).
    ///
    /// Records carry no timestamp; the operation is stamped on receipt.
    pub fn handle_remote_record(&mut self, record: OperationRecord) -> RemoteOutcome {
        match record.to_operation() {
            Ok(op) => self.handle_remote_operation(op.with_created_at(self.clock.now())),
            Err(e) => {
                log::warn!("Rejected record from {}: {e}", record.client_id);
                RemoteOutcome::Rejected(e)
            }
        }
    }

    fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Acknowledged { seq } => {
                let echo_expected = self.subscription.is_some() && seq > self.subscribed_after;
                let known = if echo_expected {
                    self.pending.acknowledge(seq)
                } else {
                    self.pending.remove(seq).is_some()
                };
                if !known {
                    log::trace!("Ack for operation {seq} after its echo");
                }
            }
            SendOutcome::Exhausted {
                seq,
                attempts,
                error,
            } => {
                if let Some(operation) = self.pending.remove(seq) {
                    log::warn!(
                        "{} may have diverged from the feed: {operation} was never sent",
                        self.document_id
                    );
                    self.emit(CoordinatorEvent::OperationDropped {
                        operation,
                        attempts,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }

    /// Wait for and handle the next send outcome or remote record.
    ///
    /// Outcomes already buffered are handled before the next remote record.
    /// A subscription that ends moves the coordinator to `Disconnected`.
    /// Returns false when nothing more can arrive.
    pub async fn next_incoming(&mut self) -> bool {
        let incoming = match (self.subscription.as_mut(), self.outcomes.as_mut()) {
            (None, None) => return false,
            (Some(subscription), None) => Incoming::Remote(subscription.recv().await),
            (None, Some(outcomes)) => Incoming::Outcome(outcomes.recv().await),
            (Some(subscription), Some(outcomes)) => tokio::select! {
                biased;
                outcome = outcomes.recv() => Incoming::Outcome(outcome),
                record = subscription.recv() => Incoming::Remote(record),
            },
        };

        match incoming {
            Incoming::Remote(Some(record)) => {
                self.handle_remote_record(record);
            }
            Incoming::Remote(None) => self.subscription_lost(),
            Incoming::Outcome(Some(outcome)) => self.handle_send_outcome(outcome),
            Incoming::Outcome(None) => self.outcomes = None,
        }
        true
    }

    /// Handle everything already buffered without waiting. Returns how many
    /// records and outcomes were handled.
    pub fn process_incoming(&mut self) -> usize {
        let mut handled = 0;

        loop {
            handled += self.drain_outcomes();
            let Some(subscription) = self.subscription.as_mut() else {
                break;
            };
            match subscription.try_recv() {
                Ok(record) => {
                    self.handle_remote_record(record);
                    handled += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.subscription_lost();
                    break;
                }
            }
        }

        handled
    }

    fn drain_outcomes(&mut self) -> usize {
        let mut handled = 0;
        while let Some(outcomes) = self.outcomes.as_mut() {
            match outcomes.try_recv() {
                Ok(outcome) => {
                    self.handle_send_outcome(outcome);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    fn subscription_lost(&mut self) {
        log::warn!("Lost subscription to {}", self.document_id);
        self.subscription = None;
        // Their echoes will never arrive now.
        let dropped = self.pending.remove_acknowledged();
        if dropped > 0 {
            log::debug!("Cleared {dropped} acknowledged operations awaiting echo");
        }
        if self.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Register this client as an active editor with its cursor at 0.
    pub async fn join_as_active_editor(&mut self) {
        self.cursor_position = 0;
        let now = self.clock.now();
        if let Err(e) = self
            .backends
            .presence
            .upsert(&self.document_id, &self.client_id, 0, now)
            .await
        {
            log::warn!("Could not join presence for {}: {e}", self.document_id);
        }
    }

    /// Record a cursor move and refresh this client's `last_seen`.
    pub async fn update_cursor_position(&mut self, cursor_position: usize) {
        self.cursor_position = cursor_position;
        let now = self.clock.now();
        if let Err(e) = self
            .backends
            .presence
            .upsert(&self.document_id, &self.client_id, cursor_position, now)
            .await
        {
            log::warn!("Cursor update failed for {}: {e}", self.document_id);
        }
    }

    /// Reload the other clients seen inside the presence window.
    ///
    /// Keeps the previous list if the store is unreachable.
    pub async fn load_active_editors(&mut self) -> &[ActiveEditor] {
        let now = self.clock.now();
        let window = self.config.presence_window;
        let since = now.saturating_sub(window.as_millis() as u64);

        match self.backends.presence.query(&self.document_id, since).await {
            Ok(rows) => {
                let mut editors: Vec<ActiveEditor> = rows
                    .into_iter()
                    .filter(|e| e.client_id != self.client_id && e.is_live(now, window))
                    .collect();
                editors.sort_by(|a, b| a.client_id.cmp(&b.client_id));

                if editors != self.active_editors {
                    self.active_editors = editors;
                    self.emit(CoordinatorEvent::ActiveEditorsChanged(
                        self.active_editors.clone(),
                    ));
                }
            }
            Err(e) => log::warn!("Could not load active editors for {}: {e}", self.document_id),
        }
        &self.active_editors
    }

    /// Remove this client's presence row. Errors are swallowed.
    pub async fn leave_as_active_editor(&mut self) {
        if let Err(e) = self
            .backends
            .presence
            .delete(&self.document_id, &self.client_id)
            .await
        {
            log::debug!("Ignoring presence delete failure for {}: {e}", self.document_id);
        }
    }

    /// Heartbeat: re-upsert the current cursor and reload active editors.
    pub async fn refresh_presence(&mut self) -> &[ActiveEditor] {
        self.update_cursor_position(self.cursor_position).await;
        self.load_active_editors().await
    }

    /// Leave presence and stop listening. Operations already handed to the
    /// sender are still appended in the background.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.leave_as_active_editor().await;
        self.subscription = None;
        if let Some(sender) = self.sender.take() {
            drop(sender.shutdown());
        }
        self.outcomes = None;
        self.set_state(ConnectionState::Closed);
        log::info!("Coordinator {} closed {}", self.client_id, self.document_id);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("{} on {}: {:?} -> {state:?}", self.client_id, self.document_id, self.state);
            self.state = state;
            self.emit(CoordinatorEvent::ConnectionChanged(state));
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            log::debug!("Event channel full; dropping event");
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn text(&self) -> &str {
        &self.document.text
    }

    pub fn version(&self) -> u64 {
        self.document.version
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn cursor_position(&self) -> usize {
        self.cursor_position
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn active_editors(&self) -> &[ActiveEditor] {
        &self.active_editors
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}
