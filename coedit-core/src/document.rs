//! Per-document authoritative state: content, version counter, and the
//! pending-operation buffer.
//!
//! ```text
//! apply_local ──► content (optimistic) ──► pending ──► transport
//!                                             ▲
//! apply_remote ──► transform against ─────────┘
//!                  pending, then apply
//! ```
//!
//! One `DocumentState` instance exclusively owns a document's content and
//! version. All mutation goes through [`DocumentState::apply_local`] and
//! [`DocumentState::apply_remote`]; external readers get immutable
//! [`DocumentSnapshot`] copies. Both apply paths are synchronous, in-memory,
//! and atomic: they validate fully before mutating, or mutate not at all.
//!
//! Send discipline: at most one local operation is in flight at a time. The
//! head of `pending` is handed to the transport via
//! [`DocumentState::next_to_send`]; later edits accumulate (and compose)
//! behind it until the authority's echo acknowledges the head. This is what
//! lets an echo be matched back to its pending original by author and
//! sequence number alone.
//!
//! Reference: Kleppmann, Chapter 5 — Replication.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use str_indices::chars;
use uuid::Uuid;

use crate::operation::{apply, compose, EngineError, Operation};
use crate::transform::transform_lists;

/// Milliseconds since the Unix epoch. Used to stamp conflicts and presence.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Document synchronization state.
///
/// `Unloaded -> Loading -> Synced`, with `Buffering` entered while an
/// out-of-order remote operation waits for the gap to fill. `Diverged` is
/// terminal: a remote operation failed to transform or apply against local
/// history, and only a full resync recovers the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unloaded,
    Loading,
    Synced,
    Buffering,
    Diverged,
}

/// Immutable copy of `(content, version)` for external readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: u64,
}

/// How a conflict record gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Folded in by the transform; recorded for observability.
    Automatic,
    /// Awaiting a decision — e.g. a pending edit dropped during resync,
    /// offered back to the caller.
    Pending,
    /// The user picked an outcome.
    UserChoice,
}

/// Two concurrent operations touched overlapping ranges at the same base
/// version. Created during remote rebase or resync, destroyed once the
/// resolution is folded into the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub operations: Vec<Operation>,
    pub resolution: ConflictResolution,
    pub created_at: u64,
}

impl Conflict {
    fn new(operations: Vec<Operation>, resolution: ConflictResolution) -> Self {
        Self {
            id: Uuid::new_v4(),
            operations,
            resolution,
            created_at: epoch_millis(),
        }
    }

    /// A conflict the transform already resolved.
    pub fn automatic(operations: Vec<Operation>) -> Self {
        Self::new(operations, ConflictResolution::Automatic)
    }

    /// A conflict awaiting caller input (resync drop).
    pub fn unresolved(operations: Vec<Operation>) -> Self {
        Self::new(operations, ConflictResolution::Pending)
    }
}

impl PartialEq for Conflict {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Result of feeding one remote operation to [`DocumentState::apply_remote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// A foreign operation was rebased and applied.
    Applied {
        version: u64,
        conflicts: Vec<Conflict>,
    },
    /// The authority acknowledged our own pending head.
    AckedLocal { acked_through: u64 },
    /// Arrived ahead of a gap; parked until the stream is contiguous.
    Buffered,
    /// Already applied at an earlier version; ignored.
    Duplicate,
}

/// Authoritative per-document state store.
#[derive(Debug)]
pub struct DocumentState {
    content: String,
    version: u64,
    /// Locally-originated operations not yet acknowledged by the authority,
    /// in submission order. The first `in_flight` entries have been handed
    /// to the transport.
    pending: Vec<Operation>,
    in_flight: usize,
    acked_through: u64,
    /// Out-of-order remote operations, keyed by the version they target.
    buffer: BTreeMap<u64, Operation>,
    sync: SyncState,
}

impl DocumentState {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            version: 0,
            pending: Vec::new(),
            in_flight: 0,
            acked_through: 0,
            buffer: BTreeMap::new(),
            sync: SyncState::Unloaded,
        }
    }

    /// Mark the snapshot fetch as started.
    pub fn begin_loading(&mut self) {
        if self.sync == SyncState::Unloaded {
            self.sync = SyncState::Loading;
        }
    }

    /// Install the authoritative snapshot and enter `Synced`.
    pub fn complete_load(&mut self, content: impl Into<String>, version: u64) {
        self.content = content.into();
        self.version = version;
        self.acked_through = version;
        self.pending.clear();
        self.in_flight = 0;
        self.buffer.clear();
        self.sync = SyncState::Synced;
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Document length in codepoints.
    pub fn char_len(&self) -> u64 {
        chars::count(&self.content) as u64
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn acked_through(&self) -> u64 {
        self.acked_through
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn pending_ops(&self) -> &[Operation] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_buffering(&self) -> bool {
        self.sync == SyncState::Buffering
    }

    /// Immutable copy for external readers (metrics, UI).
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            version: self.version,
        }
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        match self.sync {
            SyncState::Unloaded | SyncState::Loading => Err(EngineError::NotLoaded),
            SyncState::Diverged => Err(EngineError::Diverged),
            SyncState::Synced | SyncState::Buffering => Ok(()),
        }
    }

    /// Optimistically apply a local edit.
    ///
    /// The operation must target the current version (`StaleVersion`
    /// otherwise — the caller rebases and resubmits) and stay in bounds
    /// (`InvalidRange`, rejected before any mutation). On success the edit
    /// is live in `content`, queued in `pending`, and the new version is
    /// returned.
    pub fn apply_local(&mut self, op: Operation) -> Result<u64, EngineError> {
        self.ensure_writable()?;
        if op.doc_version != self.version {
            return Err(EngineError::StaleVersion {
                submitted: op.doc_version,
                current: self.version,
            });
        }
        self.content = apply(&self.content, &op)?;
        self.version += 1;

        // Compact the unsent tail so a typing burst queues as one operation.
        // In-flight entries are never composed into: the authority's echoes
        // must keep matching them one to one.
        if self.pending.len() > self.in_flight {
            let last = self.pending.pop().expect("unsent tail exists");
            self.pending.extend(compose(&last, &op));
        } else {
            self.pending.push(op);
        }
        Ok(self.version)
    }

    /// Hand the next pending operation to the transport, if none is in
    /// flight. The returned operation is stamped with `acked_through` — the
    /// last authority version this replica has seen, which is the base the
    /// authority will transform against.
    pub fn next_to_send(&mut self) -> Option<Operation> {
        if self.in_flight > 0 || self.pending.is_empty() {
            return None;
        }
        self.in_flight = 1;
        let mut op = self.pending[0].clone();
        op.doc_version = self.acked_through;
        Some(op)
    }

    /// Whether a send is outstanding.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight > 0
    }

    /// Apply one authority-ordered remote operation.
    ///
    /// `op.doc_version` is the authority version the operation is based on.
    /// Earlier versions are duplicates (idempotent, no mutation); later ones
    /// are buffered until the gap fills; the contiguous case either pops our
    /// own acknowledged head off `pending` or rebases `pending` against the
    /// foreign operation and applies it.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<RemoteOutcome, EngineError> {
        self.ensure_writable()?;

        if op.doc_version < self.acked_through {
            return Ok(RemoteOutcome::Duplicate);
        }
        if op.doc_version > self.acked_through {
            self.buffer.insert(op.doc_version, op.clone());
            self.sync = SyncState::Buffering;
            return Ok(RemoteOutcome::Buffered);
        }

        // The authority's echo of our own head is its acknowledgement.
        if let Some(head) = self.pending.first() {
            if head.author == op.author && head.local_seq == op.local_seq {
                self.pending.remove(0);
                self.in_flight = self.in_flight.saturating_sub(1);
                self.acked_through += 1;
                self.settle_buffering();
                return Ok(RemoteOutcome::AckedLocal {
                    acked_through: self.acked_through,
                });
            }
        }

        // Foreign operation: detect overlapping concurrent edits before the
        // transform folds them in.
        let conflicts: Vec<Conflict> = self
            .pending
            .iter()
            .filter(|p| p.author != op.author && p.overlaps(op))
            .map(|p| Conflict::automatic(vec![p.clone(), op.clone()]))
            .collect();

        // Rebase the in-flight prefix and the unsent tail separately so a
        // split inside the prefix keeps the in-flight count honest.
        let incoming = std::slice::from_ref(op);
        let (sent, incoming_mid) = transform_lists(&self.pending[..self.in_flight], incoming);
        let (unsent, incoming_final) = transform_lists(&self.pending[self.in_flight..], &incoming_mid);

        // Dry-run the rebased incoming parts so a failure leaves the
        // document untouched and flags divergence.
        let mut next_content = self.content.clone();
        for part in &incoming_final {
            match apply(&next_content, part) {
                Ok(c) => next_content = c,
                Err(_) => {
                    self.sync = SyncState::Diverged;
                    return Err(EngineError::Diverged);
                }
            }
        }

        let grown = (sent.len() + unsent.len()) as u64 - self.pending.len() as u64;
        self.in_flight = sent.len();
        self.pending = sent;
        self.pending.extend(unsent);
        self.content = next_content;
        // One authority version, plus one version per pending entry a split
        // added (each such entry will be acknowledged on its own).
        self.version += 1 + grown;
        self.acked_through += 1;
        self.settle_buffering();

        Ok(RemoteOutcome::Applied {
            version: self.version,
            conflicts,
        })
    }

    /// Pop the buffered operation that fills the current gap, if any. The
    /// session replays these through [`DocumentState::apply_remote`] until
    /// the stream is contiguous again.
    pub fn take_ready_buffered(&mut self) -> Option<Operation> {
        self.buffer.remove(&self.acked_through)
    }

    fn settle_buffering(&mut self) {
        // Stale entries are duplicates; ready and future entries wait for
        // replay via `take_ready_buffered`.
        let acked = self.acked_through;
        self.buffer.retain(|v, _| *v >= acked);
        if self.sync == SyncState::Buffering && self.buffer.is_empty() {
            self.sync = SyncState::Synced;
        }
    }

    /// Force the terminal diverged state (protocol bug or unfillable gap).
    pub fn mark_diverged(&mut self) {
        self.sync = SyncState::Diverged;
    }

    /// Discard local history and install a fresh authoritative snapshot,
    /// preserving what can be preserved of `pending`.
    ///
    /// Operations that were already in flight have an unknown fate — the
    /// authority may have applied them before the link died, and the fresh
    /// snapshot may already contain their effect — so they are never
    /// reapplied automatically: they come back as unresolved [`Conflict`]s,
    /// offered to the caller. Unsent edits were never seen by the authority;
    /// each is revalidated against the new content in order and reapplied
    /// optimistically if it still fits, or surfaced as a [`Conflict`] too.
    /// Nothing is dropped silently.
    pub fn resync(&mut self, content: impl Into<String>, version: u64) -> Vec<Conflict> {
        let old_pending = std::mem::take(&mut self.pending);
        let sent = self.in_flight.min(old_pending.len());
        self.complete_load(content, version);

        let mut dropped = Vec::new();
        for (i, mut op) in old_pending.into_iter().enumerate() {
            if op.is_noop() {
                continue;
            }
            if i < sent {
                dropped.push(Conflict::unresolved(vec![op]));
                continue;
            }
            op.doc_version = self.version;
            let preserved = op.clone();
            if self.apply_local(op).is_err() {
                dropped.push(Conflict::unresolved(vec![preserved]));
            }
        }
        dropped
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}
