//! # tandem-collab — Collaborative editing coordinator for tandem
//!
//! Runs the OT engine from `tandem-core` against real backends: a change
//! feed that logs and broadcasts operations, a presence store and a
//! snapshot cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ChangeFeed    ┌─────────────┐
//! │ Coordinator │ ◄─────────────► │ RelayServer │
//! │ (per client)│  WsFeed / Memory│ (shared)    │
//! └──────┬──────┘                 └──────┬──────┘
//!        │                               │
//!        ▼                               ▼
//! ┌─────────────┐                 ┌──────────────┐
//! │ PresenceStore│                │OperationStore│
//! │ SnapshotStore│                │ (RocksDB)    │
//! └─────────────┘                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`] — per-client state machine: optimistic edits, rebase, presence
//! - [`feed`] — `ChangeFeed` seam and the in-process `MemoryFeed`
//! - [`presence`] / [`snapshot`] — presence and snapshot-cache seams
//! - [`retry`] — bounded linear-backoff retry
//! - [`protocol`] — feed records and bincode relay frames
//! - [`relay`] / [`ws_feed`] — WebSocket relay and its client
//! - [`storage`] — RocksDB operation log and snapshot cache

pub mod clock;
pub mod coordinator;
pub mod feed;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod retry;
mod sender;
pub mod snapshot;
pub mod storage;
pub mod ws_feed;

// Re-exports for convenience
pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidIds};
pub use coordinator::{
    Backends, ConnectionState, Coordinator, CoordinatorBuilder, CoordinatorConfig,
    CoordinatorEvent, RemoteOutcome,
};
pub use feed::{ChangeFeed, FeedError, FeedRoom, FeedRooms, FeedStats, MemoryFeed, Subscription};
pub use pending::{PendingOperation, PendingQueue};
pub use presence::{ActiveEditor, MemoryPresenceStore, PresenceError, PresenceStore, PRESENCE_WINDOW};
pub use protocol::{FeedMessage, OperationRecord, ProtocolError};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use retry::{retry_with_policy, RecordingSleeper, RetryError, RetryPolicy, Sleeper, TokioSleeper};
pub use snapshot::{MemorySnapshotStore, SnapshotError, SnapshotStore};
pub use storage::{DocumentMetadata, OperationStore, StoreConfig, StoreError};
pub use ws_feed::WsFeed;
