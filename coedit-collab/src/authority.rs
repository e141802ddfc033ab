//! In-process ordering authority: the reference [`Transport`] +
//! [`SnapshotStore`] the integration tests and demos run against.
//!
//! ```text
//! session A ──send──► Room (doc_id) ── order + apply ──► broadcast
//! session B ──send──►   │ content, version, history         │
//!                       ▼                                   ▼
//!                  load_snapshot                   every subscriber
//!                                                  (echo = your ack)
//! ```
//!
//! Each document room serializes its mutations behind one async mutex — the
//! server-side rendering of the one-actor-per-document rule. An incoming
//! operation based on version `v` is transformed against every history entry
//! the sender had not seen, assigned the next version, applied, and echoed
//! to all subscribers, the sender included: the echo of your own operation
//! is your acknowledgement.
//!
//! A production deployment swaps this out for a real network transport; the
//! session layer cannot tell the difference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use coedit_core::{apply, transform_lists, DocumentSnapshot, Operation};

use crate::protocol::{Envelope, MessageType};
use crate::transport::{SnapshotStore, Transport, TransportError};

/// Per-subscriber buffered envelopes before a lagging subscriber starts
/// dropping messages.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

struct Room {
    content: String,
    version: u64,
    /// Ordered operation log; entry `i` is stamped with the version it was
    /// applied at, so a suffix scan finds everything concurrent with an
    /// incoming operation.
    history: Vec<Operation>,
    broadcast: broadcast::Sender<Envelope>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            content: String::new(),
            version: 0,
            history: Vec::new(),
            broadcast,
        }
    }

    /// Transform an incoming operation over the history suffix it had not
    /// seen, then apply and log each resulting part at its own version.
    /// Returns the assigned parts, empty if the operation was rejected.
    fn order_and_apply(&mut self, op: Operation) -> Vec<Operation> {
        let base = op.doc_version;
        if base > self.version {
            log::warn!(
                "rejecting operation from {} based on future version {base} (authority at {})",
                op.author,
                self.version
            );
            return Vec::new();
        }

        let mut parts = vec![op];
        for h in &self.history {
            if h.doc_version >= base {
                let (rebased, _) = transform_lists(&parts, std::slice::from_ref(h));
                parts = rebased;
            }
        }

        // Dry-run so a mid-sequence failure commits nothing.
        let mut next = self.content.clone();
        for part in &parts {
            match apply(&next, part) {
                Ok(c) => next = c,
                Err(e) => {
                    log::error!("rejecting operation from {}: {e}", parts[0].author);
                    return Vec::new();
                }
            }
        }
        self.content = next;

        let mut assigned = Vec::with_capacity(parts.len());
        for mut part in parts {
            part.doc_version = self.version;
            self.version += 1;
            self.history.push(part.clone());
            assigned.push(part);
        }
        assigned
    }
}

/// The in-process authority. One instance stands in for the server side of
/// the whole transport; rooms spring into being on first touch.
pub struct LocalAuthority {
    rooms: RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>,
    capacity: usize,
    bytes_toward_authority: AtomicU64,
    bytes_toward_clients: AtomicU64,
}

impl LocalAuthority {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            bytes_toward_authority: AtomicU64::new(0),
            bytes_toward_clients: AtomicU64::new(0),
        }
    }

    async fn room(&self, doc_id: Uuid) -> Arc<Mutex<Room>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        // Double-check after taking the write lock.
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }
        let room = Arc::new(Mutex::new(Room::new(self.capacity)));
        rooms.insert(doc_id, room.clone());
        room
    }

    /// Install initial content for a document (tests, demos).
    pub async fn seed_document(&self, doc_id: Uuid, content: impl Into<String>, version: u64) {
        let room = self.room(doc_id).await;
        let mut room = room.lock().await;
        room.content = content.into();
        room.version = version;
        room.history.clear();
    }

    /// The authoritative `(content, version)` pair, for assertions.
    pub async fn document(&self, doc_id: Uuid) -> Option<(String, u64)> {
        let rooms = self.rooms.read().await;
        match rooms.get(&doc_id) {
            Some(room) => {
                let room = room.lock().await;
                Some((room.content.clone(), room.version))
            }
            None => None,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    fn fan_out(&self, room: &Room, envelope: Envelope) {
        self.bytes_toward_clients
            .fetch_add(envelope.wire_len(), Ordering::Relaxed);
        // Zero subscribers is fine; nobody is listening yet.
        let _ = room.broadcast.send(envelope);
    }
}

impl Default for LocalAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalAuthority {
    async fn send(&self, doc_id: Uuid, envelope: Envelope) -> Result<(), TransportError> {
        self.bytes_toward_authority
            .fetch_add(envelope.wire_len(), Ordering::Relaxed);

        let room = self.room(doc_id).await;
        let mut room = room.lock().await;

        match envelope.kind {
            MessageType::Operation => {
                let op = envelope
                    .operation_payload()
                    .map_err(|e| TransportError::Failure(e.to_string()))?;
                let sender = envelope.sender;
                for part in room.order_and_apply(op) {
                    let echo = Envelope::operation(sender, doc_id, &part);
                    self.fan_out(&room, echo);
                }
            }
            MessageType::Presence => {
                // Presence is not order-sensitive; pass it straight through.
                self.fan_out(&room, envelope);
            }
            MessageType::Ping => {
                self.fan_out(&room, Envelope::pong(Uuid::nil(), doc_id));
            }
            MessageType::Pong => {}
        }
        Ok(())
    }

    async fn subscribe(&self, doc_id: Uuid) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        let room = self.room(doc_id).await;
        let mut upstream = {
            let room = room.lock().await;
            room.broadcast.subscribe()
        };
        let (tx, rx) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break; // subscriber went away
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("subscriber lagged, {n} envelopes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_toward_authority.load(Ordering::Relaxed)
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_toward_clients.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SnapshotStore for LocalAuthority {
    async fn load_snapshot(&self, doc_id: Uuid) -> Result<DocumentSnapshot, TransportError> {
        let room = self.room(doc_id).await;
        let room = room.lock().await;
        Ok(DocumentSnapshot {
            content: room.content.clone(),
            version: room.version,
        })
    }

    async fn save_snapshot(
        &self,
        _doc_id: Uuid,
        _content: &str,
        _version: u64,
    ) -> Result<(), TransportError> {
        // The authority already holds the canonical copy; checkpoint saves
        // from sessions have nothing to add here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_core::{OpKind, UserId};

    fn uid(n: u128) -> UserId {
        Uuid::from_u128(n)
    }

    #[tokio::test]
    async fn test_orders_and_echoes_operation() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        authority.seed_document(doc, "ab", 1).await;

        let mut rx = authority.subscribe(doc).await.unwrap();

        let op = Operation::insert(1, "X", uid(1)).with_base(1).with_seq(1);
        authority
            .send(doc, Envelope::operation(uid(1), doc, &op))
            .await
            .unwrap();

        let echo = rx.recv().await.unwrap();
        assert_eq!(echo.kind, MessageType::Operation);
        assert_eq!(echo.version, 1);
        assert_eq!(echo.operation_payload().unwrap().local_seq, 1);

        let (content, version) = authority.document(doc).await.unwrap();
        assert_eq!(content, "aXb");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_ops_from_two_senders_converge() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        authority.seed_document(doc, "ab", 1).await;

        // Both based on version 1: B's delete and A's insert race.
        let a_op = Operation::insert(1, "X", uid(1)).with_base(1).with_seq(1);
        let b_op = Operation::delete(0, 1, uid(2)).with_base(1).with_seq(1);

        authority
            .send(doc, Envelope::operation(uid(2), doc, &b_op))
            .await
            .unwrap();
        authority
            .send(doc, Envelope::operation(uid(1), doc, &a_op))
            .await
            .unwrap();

        let (content, version) = authority.document(doc).await.unwrap();
        assert_eq!(content, "Xb");
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_same_position_inserts_deterministic_order() {
        // Lower author id wins the earlier slot regardless of arrival order.
        for arrival_flipped in [false, true] {
            let authority = LocalAuthority::new();
            let doc = Uuid::new_v4();

            let u1 = Operation::insert(0, "A", uid(1)).with_base(0).with_seq(1);
            let u2 = Operation::insert(0, "B", uid(2)).with_base(0).with_seq(1);
            let (first, second) = if arrival_flipped {
                (&u2, &u1)
            } else {
                (&u1, &u2)
            };

            authority
                .send(doc, Envelope::operation(first.author, doc, first))
                .await
                .unwrap();
            authority
                .send(doc, Envelope::operation(second.author, doc, second))
                .await
                .unwrap();

            let (content, _) = authority.document(doc).await.unwrap();
            assert_eq!(content, "AB", "arrival_flipped={arrival_flipped}");
        }
    }

    #[tokio::test]
    async fn test_delete_straddling_insert_splits_into_two_versions() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        authority.seed_document(doc, "abcdef", 1).await;

        let mut rx = authority.subscribe(doc).await.unwrap();

        let ins = Operation::insert(3, "XY", uid(1)).with_base(1).with_seq(1);
        let del = Operation::delete(1, 4, uid(2)).with_base(1).with_seq(1);
        authority
            .send(doc, Envelope::operation(uid(1), doc, &ins))
            .await
            .unwrap();
        authority
            .send(doc, Envelope::operation(uid(2), doc, &del))
            .await
            .unwrap();

        let (content, version) = authority.document(doc).await.unwrap();
        assert_eq!(content, "aXYf");
        // Insert, then the split delete as two separately-versioned parts.
        assert_eq!(version, 4);

        let _ins_echo = rx.recv().await.unwrap();
        let part1 = rx.recv().await.unwrap().operation_payload().unwrap();
        let part2 = rx.recv().await.unwrap().operation_payload().unwrap();
        assert!(matches!(part1.kind, OpKind::Delete { .. }));
        assert!(matches!(part2.kind, OpKind::Delete { .. }));
        assert_eq!(part1.local_seq, part2.local_seq);
    }

    #[tokio::test]
    async fn test_presence_passes_through_untransformed() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        let mut rx = authority.subscribe(doc).await.unwrap();

        let delta = crate::presence::PresenceDelta::Cursor {
            user_id: uid(1),
            position: Some(7),
            timestamp: 1,
        };
        authority
            .send(doc, Envelope::presence(uid(1), doc, &delta))
            .await
            .unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, MessageType::Presence);
        assert_eq!(env.presence_payload().unwrap(), delta);
        // Presence never advances the document version.
        assert_eq!(authority.document(doc).await.unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        let mut rx = authority.subscribe(doc).await.unwrap();

        authority.send(doc, Envelope::ping(uid(1), doc)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_stale_base_gets_transformed_not_rejected() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        authority.seed_document(doc, "hello", 0).await;

        authority
            .send(
                doc,
                Envelope::operation(
                    uid(1),
                    doc,
                    &Operation::insert(5, "!", uid(1)).with_base(0).with_seq(1),
                ),
            )
            .await
            .unwrap();
        // Based on version 0, arriving after the document moved to 1.
        authority
            .send(
                doc,
                Envelope::operation(
                    uid(2),
                    doc,
                    &Operation::insert(0, ">", uid(2)).with_base(0).with_seq(1),
                ),
            )
            .await
            .unwrap();

        let (content, _) = authority.document(doc).await.unwrap();
        assert_eq!(content, ">hello!");
    }

    #[tokio::test]
    async fn test_byte_counters_advance() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        let _rx = authority.subscribe(doc).await.unwrap();

        authority
            .send(
                doc,
                Envelope::operation(
                    uid(1),
                    doc,
                    &Operation::insert(0, "hi", uid(1)).with_base(0).with_seq(1),
                ),
            )
            .await
            .unwrap();

        assert!(authority.bytes_sent() > 0);
        assert!(authority.bytes_received() > 0);
    }

    #[tokio::test]
    async fn test_snapshot_store_roundtrip() {
        let authority = LocalAuthority::new();
        let doc = Uuid::new_v4();
        authority.seed_document(doc, "seeded", 5).await;

        let snap = authority.load_snapshot(doc).await.unwrap();
        assert_eq!(snap.content, "seeded");
        assert_eq!(snap.version, 5);

        authority.save_snapshot(doc, "ignored", 9).await.unwrap();
        // The authority's copy is canonical; saves are accepted and moot.
        assert_eq!(authority.load_snapshot(doc).await.unwrap().content, "seeded");
    }
}
