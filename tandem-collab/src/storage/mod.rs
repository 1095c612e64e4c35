//! Persistent storage for the relay.
//!
//! ```text
//! ┌─────────────┐   append    ┌────────────────┐
//! │ RelayServer │ ──────────► │ OperationStore │
//! └──────┬──────┘             │ (RocksDB)      │
//!        │ history           └───────┬────────┘
//!        ▼                           │ column families
//! ┌─────────────┐   ┌──────────────────────────────────────┐
//! │ WsFeed      │   │ CF "snapshots"  — cached documents   │
//! │ (clients)   │   │ CF "operations" — the operation log  │
//! └─────────────┘   │ CF "metadata"   — per-doc counters   │
//!                   └──────────────────────────────────────┘
//! ```
//!
//! The operation log is the source of truth. Snapshots are a cache.

pub mod rocks;

pub use rocks::{DocumentMetadata, OperationStore, StoreConfig, StoreError};
