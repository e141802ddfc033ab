//! # coedit-core — Deterministic engine for collaborative text editing
//!
//! The pure heart of the editing stack: the operation vocabulary, the
//! operational-transform algorithm, and the per-document state store that
//! keeps concurrent editors convergent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   apply_local    ┌───────────────┐
//! │ local edits  │ ───────────────► │ DocumentState │──► pending ──► wire
//! └──────────────┘                  │  content      │
//! ┌──────────────┐   transform +    │  version      │
//! │ remote ops   │ ───────────────► │  acked_through│
//! └──────────────┘   apply_remote   └───────────────┘
//! ```
//!
//! Everything here is synchronous, allocation-light, and free of clocks and
//! I/O on the apply path, so the convergence properties are testable without
//! timing flakiness. The async session, presence, and metrics layers live in
//! the `coedit-collab` crate on top.
//!
//! ## Modules
//!
//! - [`operation`] — insert/delete/retain ops, composition, inversion
//! - [`transform`] — OT rebasing with the deterministic tie-break
//! - [`document`] — the state store, sync state machine, conflict records

pub mod document;
pub mod operation;
pub mod transform;

// Re-exports for convenience
pub use document::{
    epoch_millis, Conflict, ConflictResolution, DocumentSnapshot, DocumentState, RemoteOutcome,
    SyncState,
};
pub use operation::{apply, apply_all, compose, EngineError, OpKind, Operation, UserId};
pub use transform::{transform, transform_lists, transform_pair};
