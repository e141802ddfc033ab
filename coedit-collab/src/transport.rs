//! Abstract contracts for the external collaborators this core consumes:
//! the message channel, the snapshot store, and the identity provider.
//!
//! The session layer never talks to a concrete network or database. It holds
//! trait objects, which is what lets the whole stack run against the
//! in-process [`crate::authority::LocalAuthority`] in tests and against a
//! real transport in production.

use async_trait::async_trait;
use coedit_core::DocumentSnapshot;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::presence::UserProfile;
use crate::protocol::Envelope;

/// Transport-level failures. Recovered automatically by the session's
/// reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel rejected or lost a message.
    Failure(String),
    /// The channel is closed and will not recover on its own.
    Closed,
    /// No snapshot exists for the requested document.
    SnapshotMissing(Uuid),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Failure(e) => write!(f, "transport failure: {e}"),
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::SnapshotMissing(doc) => {
                write!(f, "no snapshot for document {doc}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Reliable-or-unreliable message channel to the ordering authority.
///
/// Implementations must preserve per-document operation order on the
/// subscription stream; presence envelopes may be dropped or reordered.
/// `send` resolving means the envelope was handed off — the *ordering*
/// acknowledgement for an operation is the authority's echo of it coming
/// back through the subscription at its assigned version.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope toward the authority.
    async fn send(&self, doc_id: Uuid, envelope: Envelope) -> Result<(), TransportError>;

    /// Open the ordered per-document stream of envelopes from the authority.
    async fn subscribe(&self, doc_id: Uuid) -> Result<mpsc::Receiver<Envelope>, TransportError>;

    /// Total bytes handed to this transport. Consumed by the metrics tick.
    fn bytes_sent(&self) -> u64;

    /// Total bytes delivered by this transport.
    fn bytes_received(&self) -> u64;
}

/// Persistent snapshot storage, touched only at join/resync time and at
/// periodic checkpoints — never on every operation.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, doc_id: Uuid) -> Result<DocumentSnapshot, TransportError>;

    async fn save_snapshot(
        &self,
        doc_id: Uuid,
        content: &str,
        version: u64,
    ) -> Result<(), TransportError>;
}

/// Supplies the local user's identity for presence. Consumed, never managed.
pub trait IdentityProvider: Send + Sync {
    fn profile(&self) -> UserProfile;
}

/// Fixed identity, handy for tests and single-user embedding.
pub struct StaticIdentity {
    profile: UserProfile,
}

impl StaticIdentity {
    pub fn new(profile: UserProfile) -> Self {
        Self { profile }
    }
}

impl IdentityProvider for StaticIdentity {
    fn profile(&self) -> UserProfile {
        self.profile.clone()
    }
}
