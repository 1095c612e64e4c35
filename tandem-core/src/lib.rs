//! # tandem-core — Operational transform engine
//!
//! Pure, synchronous building blocks for lock-free collaborative plain-text
//! editing. Nothing here does I/O; the coordinator in `tandem-collab` drives
//! these functions from the network.
//!
//! ```text
//!  old snapshot ──┐
//!                 ├─► generate_operations ─► [Delete?, Insert?] ─► apply ─► new snapshot
//!  new snapshot ──┘
//!
//!  remote op ─► transform(·, pending₁) ─► … ─► transform(·, pendingₙ) ─► apply
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — immutable Insert/Delete operations and validation
//! - [`transform`] — `transform`, `apply`, `generate_operations`
//! - [`document`] — `(text, version)` snapshot

pub mod operation;
pub mod transform;
pub mod document;

pub use operation::{now_millis, Operation, OperationError, OperationKind, Timestamp};
pub use transform::{
    apply, apply_rebased, generate_operations, rebase, transform, transform_with, TieBreak,
};
pub use document::Document;
