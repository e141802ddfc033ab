//! # coedit-collab — Session, presence, and metrics for collaborative editing
//!
//! The async layer over the `coedit-core` engine: per-document session
//! actors, cursor/selection presence, reconnect-with-backoff, and the
//! read-only metrics rollup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌───────────────────┐   Envelope    ┌───────────────┐
//! │ SessionHandle│ ──────────► │ DocumentSession   │ ◄───────────► │ Transport     │
//! │ (caller API) │ ◄────────── │ (task per doc)    │               │ (authority)   │
//! └──────────────┘   events    │  DocumentState    │               └───────┬───────┘
//!                              │  PresenceTracker  │                       │
//!                              └─────────┬─────────┘               ┌───────▼───────┐
//!                                        │                         │ SnapshotStore │
//!                              ┌─────────▼─────────┐               └───────────────┘
//!                              │ MetricsAggregator │
//!                              └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope (bincode)
//! - [`session`] — per-document actor, events, reconnect, registry handle API
//! - [`registry`] — doc id → session handle
//! - [`presence`] — cursor/selection awareness, liveness sweep
//! - [`metrics`] — lock-free recording, fixed-tick rollup
//! - [`transport`] — abstract transport/storage/identity contracts
//! - [`authority`] — in-process reference authority for tests and demos

pub mod authority;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use authority::LocalAuthority;
pub use metrics::{MetricsAggregator, MetricsRecorder, SessionMetrics};
pub use presence::{
    CollaboratorPresence, PresenceConfig, PresenceDelta, PresenceStatus, PresenceTracker, Range,
    UserColor, UserProfile,
};
pub use protocol::{Envelope, MessageType, ProtocolError};
pub use registry::SessionRegistry;
pub use session::{Edit, SessionConfig, SessionEvent, SessionHandle, SyncError};
pub use transport::{
    IdentityProvider, SnapshotStore, StaticIdentity, Transport, TransportError,
};
