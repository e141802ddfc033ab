//! End-to-end tests: real sessions talking to the in-process authority,
//! verifying convergence, ordering, reconnection, and conflict surfacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use coedit_core::{DocumentSnapshot, Operation};
use coedit_collab::protocol::Envelope;
use coedit_collab::session::{Edit, SessionConfig, SessionEvent, SessionHandle, SyncError};
use coedit_collab::transport::{SnapshotStore, Transport, TransportError};
use coedit_collab::{LocalAuthority, PresenceConfig, UserProfile};

fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect_base: Duration::from_millis(10),
        reconnect_cap: Duration::from_millis(50),
        max_reconnect_attempts: 100,
        buffer_gap_timeout: Duration::from_millis(200),
        metrics_interval: Duration::from_millis(20),
        presence: PresenceConfig {
            cursor_interval: Duration::from_millis(0),
            ..PresenceConfig::default()
        },
        ..SessionConfig::default()
    }
}

async fn join(
    authority: &Arc<LocalAuthority>,
    doc: Uuid,
    name: &str,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let handle = SessionHandle::join(
        doc,
        UserProfile::new(name),
        authority.clone() as Arc<dyn Transport>,
        authority.clone() as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let events = handle.take_events().unwrap();
    (handle, events)
}

/// Wait until a session's snapshot reaches the given version.
async fn wait_for_version(handle: &SessionHandle, version: u64) -> DocumentSnapshot {
    for _ in 0..200 {
        let snap = handle.snapshot().await.unwrap();
        if snap.version >= version {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached version {version}");
}

/// Wait for the next event matching the predicate, skipping others.
async fn wait_for_event(
    events: &mut mpsc::Receiver<SessionEvent>,
    secs: u64,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            other => panic!("expected matching event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_two_sessions_converge_on_concurrent_edits() {
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "ab", 1).await;

    let (alice, _alice_events) = join(&authority, doc, "Alice").await;
    let (bob, _bob_events) = join(&authority, doc, "Bob").await;

    // Concurrent edits against the same base: an insert and a delete.
    let (r1, r2) = tokio::join!(
        alice.apply_edit(Edit::Insert {
            position: 1,
            text: "X".into(),
        }),
        bob.apply_edit(Edit::Delete {
            position: 0,
            length: 1,
        }),
    );
    r1.unwrap();
    r2.unwrap();

    let alice_snap = wait_for_version(&alice, 3).await;
    let bob_snap = wait_for_version(&bob, 3).await;
    let (authority_content, authority_version) = authority.document(doc).await.unwrap();

    assert_eq!(alice_snap.content, bob_snap.content);
    assert_eq!(alice_snap.content, authority_content);
    assert_eq!(alice_snap.content, "Xb");
    assert_eq!(authority_version, 3);
}

#[tokio::test]
async fn test_same_position_inserts_identical_on_every_replica() {
    // Scenario: two inserts at position 0; lower user id wins the earlier
    // slot no matter which replica you ask.
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "", 0).await;

    let low = UserProfile::with_id(Uuid::from_u128(1), "Low");
    let high = UserProfile::with_id(Uuid::from_u128(2), "High");

    let low_handle = SessionHandle::join(
        doc,
        low,
        authority.clone() as Arc<dyn Transport>,
        authority.clone() as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let high_handle = SessionHandle::join(
        doc,
        high,
        authority.clone() as Arc<dyn Transport>,
        authority.clone() as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();

    let (r1, r2) = tokio::join!(
        high_handle.apply_edit(Edit::Insert {
            position: 0,
            text: "B".into(),
        }),
        low_handle.apply_edit(Edit::Insert {
            position: 0,
            text: "A".into(),
        }),
    );
    r1.unwrap();
    r2.unwrap();

    let low_snap = wait_for_version(&low_handle, 2).await;
    let high_snap = wait_for_version(&high_handle, 2).await;

    assert_eq!(low_snap.content, "AB");
    assert_eq!(high_snap.content, "AB");
    assert_eq!(authority.document(doc).await.unwrap().0, "AB");
}

#[tokio::test]
async fn test_remote_edits_reach_a_quiet_session() {
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "shared", 1).await;

    let (alice, mut alice_events) = join(&authority, doc, "Alice").await;
    let (bob, _bob_events) = join(&authority, doc, "Bob").await;

    bob.apply_edit(Edit::Insert {
        position: 6,
        text: " doc".into(),
    })
    .await
    .unwrap();

    let event = wait_for_event(&mut alice_events, 2, |e| {
        matches!(e, SessionEvent::DocumentUpdated { .. })
    })
    .await;
    match event {
        SessionEvent::DocumentUpdated { content, version } => {
            assert_eq!(content, "shared doc");
            assert_eq!(version, 2);
        }
        _ => unreachable!(),
    }
    assert_eq!(alice.snapshot().await.unwrap().content, "shared doc");
}

#[tokio::test]
async fn test_conflict_event_for_overlapping_concurrent_edits() {
    // Scripted delivery so the foreign op is guaranteed to arrive while the
    // local overlapping edit is still pending.
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(FixedStore {
        content: "abcdef".into(),
        version: 1,
    });
    let doc = Uuid::new_v4();
    let remote_author = Uuid::from_u128(99);

    let handle = SessionHandle::join(
        doc,
        UserProfile::new("Alice"),
        transport.clone() as Arc<dyn Transport>,
        store as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let mut events = handle.take_events().unwrap();

    handle
        .apply_edit(Edit::Delete {
            position: 1,
            length: 3,
        })
        .await
        .unwrap();

    // Overlapping concurrent delete from another author, same base version.
    let foreign = Operation::delete(2, 3, remote_author).with_base(1).with_seq(1);
    transport
        .push(Envelope::operation(remote_author, doc, &foreign))
        .await;

    let event = wait_for_event(&mut events, 2, |e| {
        matches!(e, SessionEvent::Conflict(_))
    })
    .await;
    match event {
        SessionEvent::Conflict(conflict) => {
            assert_eq!(conflict.operations.len(), 2);
        }
        _ => unreachable!(),
    }

    // The transform folded the overlap in; content reflects both deletes.
    assert_eq!(handle.snapshot().await.unwrap().content, "af");
}

// ─── Reconnect: a transport that can be switched off ─────────────────

struct FlakyTransport {
    inner: Arc<LocalAuthority>,
    down: AtomicBool,
}

impl FlakyTransport {
    fn new(inner: Arc<LocalAuthority>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            Err(TransportError::Failure("link down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, doc_id: Uuid, envelope: Envelope) -> Result<(), TransportError> {
        self.check()?;
        self.inner.send(doc_id, envelope).await
    }

    async fn subscribe(
        &self,
        doc_id: Uuid,
    ) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        self.check()?;
        self.inner.subscribe(doc_id).await
    }

    fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent()
    }

    fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }
}

#[tokio::test]
async fn test_reconnect_surfaces_inapplicable_pending_as_conflicts() {
    // Scenario: the link dies, the user keeps editing, and by the time the
    // session reconnects the authority's document has been replaced by
    // something the queued edits no longer fit. Every one of them must come
    // back as a conflict event; none may be applied silently.
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "a long line of text", 1).await;

    let flaky = Arc::new(FlakyTransport::new(authority.clone()));
    let handle = SessionHandle::join(
        doc,
        UserProfile::new("Alice"),
        flaky.clone() as Arc<dyn Transport>,
        authority.clone() as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let mut events = handle.take_events().unwrap();

    flaky.set_down(true);

    // Three edits near the end of the document, queued while offline. The
    // first triggers the send failure that starts the backoff.
    for position in [14, 13, 12] {
        handle
            .apply_edit(Edit::Delete {
                position,
                length: 1,
            })
            .await
            .unwrap();
    }

    wait_for_event(&mut events, 2, |e| matches!(e, SessionEvent::Disconnected)).await;

    // While we are away the document shrinks far below position 14.
    authority.seed_document(doc, "ok", 50).await;
    flaky.set_down(false);

    wait_for_event(&mut events, 5, |e| matches!(e, SessionEvent::Connected)).await;

    let mut conflicts = 0;
    let mut loaded = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while loaded.is_none() {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(SessionEvent::Conflict(c))) => {
                conflicts += 1;
                assert!(!c.operations.is_empty());
            }
            Ok(Some(SessionEvent::DocumentLoaded(snap))) => loaded = Some(snap),
            Ok(Some(_)) => continue,
            other => panic!("expected conflicts then DocumentLoaded, got {other:?}"),
        }
    }

    // The in-flight delete has an unknown fate and the composed offline
    // deletes no longer fit the shrunken document: surfaced, never silent.
    assert_eq!(conflicts, 2);
    assert_eq!(loaded.unwrap().content, "ok");
    assert_eq!(handle.snapshot().await.unwrap().content, "ok");
}

#[tokio::test]
async fn test_manual_reconnect_refetches_snapshot() {
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "v1", 1).await;

    let (handle, mut events) = join(&authority, doc, "Alice").await;

    // The authority's document is replaced behind our back; a plain
    // reconnect must pick the new canonical state up, never the old one.
    authority.seed_document(doc, "second draft", 9).await;
    handle.reconnect().await.unwrap();

    wait_for_event(&mut events, 2, |e| matches!(e, SessionEvent::Disconnected)).await;
    wait_for_event(&mut events, 2, |e| matches!(e, SessionEvent::Connected)).await;
    let loaded = wait_for_event(&mut events, 2, |e| {
        matches!(e, SessionEvent::DocumentLoaded(_))
    })
    .await;
    match loaded {
        SessionEvent::DocumentLoaded(snap) => {
            assert_eq!(snap.content, "second draft");
            assert_eq!(snap.version, 9);
        }
        _ => unreachable!(),
    }
    assert_eq!(handle.snapshot().await.unwrap().version, 9);
}

#[tokio::test]
async fn test_offline_edits_sync_after_reconnect() {
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "hello", 1).await;

    let flaky = Arc::new(FlakyTransport::new(authority.clone()));
    let handle = SessionHandle::join(
        doc,
        UserProfile::new("Alice"),
        flaky.clone() as Arc<dyn Transport>,
        authority.clone() as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let mut events = handle.take_events().unwrap();

    flaky.set_down(true);
    handle
        .apply_edit(Edit::Insert {
            position: 5,
            text: " world".into(),
        })
        .await
        .unwrap();
    wait_for_event(&mut events, 2, |e| matches!(e, SessionEvent::Disconnected)).await;

    // An edit made fully offline (no send attempted) stays rebase-safe:
    // position 5 is valid against the authority snapshot too.
    handle
        .apply_edit(Edit::Insert {
            position: 5,
            text: "!".into(),
        })
        .await
        .unwrap();

    flaky.set_down(false);
    wait_for_event(&mut events, 5, |e| matches!(e, SessionEvent::Connected)).await;

    // The unsent offline edit is resubmitted after the fresh snapshot; the
    // one whose fate was unknown is offered back as a conflict instead.
    wait_for_event(&mut events, 5, |e| matches!(e, SessionEvent::Conflict(_))).await;

    for _ in 0..200 {
        let (content, _) = authority.document(doc).await.unwrap();
        if content == "hello!" {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "offline edit never reached the authority: {:?}",
        authority.document(doc).await
    );
}

// ─── Ordering: a transport the test scripts by hand ──────────────────

struct ScriptedTransport {
    feed: tokio::sync::Mutex<Option<mpsc::Sender<Envelope>>>,
    sent: std::sync::Mutex<Vec<Envelope>>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            feed: tokio::sync::Mutex::new(None),
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    async fn push(&self, envelope: Envelope) {
        let feed = self.feed.lock().await;
        feed.as_ref().unwrap().send(envelope).await.unwrap();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _doc_id: Uuid, envelope: Envelope) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        _doc_id: Uuid,
    ) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        *self.feed.lock().await = Some(tx);
        Ok(rx)
    }

    fn bytes_sent(&self) -> u64 {
        0
    }

    fn bytes_received(&self) -> u64 {
        0
    }
}

struct FixedStore {
    content: String,
    version: u64,
}

#[async_trait]
impl SnapshotStore for FixedStore {
    async fn load_snapshot(&self, _doc_id: Uuid) -> Result<DocumentSnapshot, TransportError> {
        Ok(DocumentSnapshot {
            content: self.content.clone(),
            version: self.version,
        })
    }

    async fn save_snapshot(
        &self,
        _doc_id: Uuid,
        _content: &str,
        _version: u64,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_out_of_order_remote_ops_apply_in_version_order() {
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(FixedStore {
        content: "ab".into(),
        version: 1,
    });
    let doc = Uuid::new_v4();
    let remote_author = Uuid::from_u128(99);

    let handle = SessionHandle::join(
        doc,
        UserProfile::new("Alice"),
        transport.clone() as Arc<dyn Transport>,
        store as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let mut events = handle.take_events().unwrap();

    // Deliver version 2's op before version 1's.
    let second = Operation::insert(0, "2", remote_author).with_base(2).with_seq(2);
    let first = Operation::insert(2, "1", remote_author).with_base(1).with_seq(1);
    transport
        .push(Envelope::operation(remote_author, doc, &second))
        .await;
    transport
        .push(Envelope::operation(remote_author, doc, &first))
        .await;

    // Updates must come out in version order: 2 then 3.
    let e1 = wait_for_event(&mut events, 2, |e| {
        matches!(e, SessionEvent::DocumentUpdated { .. })
    })
    .await;
    match e1 {
        SessionEvent::DocumentUpdated { content, version } => {
            assert_eq!(version, 2);
            assert_eq!(content, "ab1");
        }
        _ => unreachable!(),
    }
    let e2 = wait_for_event(&mut events, 2, |e| {
        matches!(e, SessionEvent::DocumentUpdated { .. })
    })
    .await;
    match e2 {
        SessionEvent::DocumentUpdated { content, version } => {
            assert_eq!(version, 3);
            assert_eq!(content, "2ab1");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_unfilled_gap_times_out_into_resync() {
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(FixedStore {
        content: "ab".into(),
        version: 1,
    });
    let doc = Uuid::new_v4();
    let remote_author = Uuid::from_u128(99);

    let handle = SessionHandle::join(
        doc,
        UserProfile::new("Alice"),
        transport.clone() as Arc<dyn Transport>,
        store as Arc<dyn SnapshotStore>,
        test_config(),
    )
    .await
    .unwrap();
    let mut events = handle.take_events().unwrap();

    // A far-future op opens a gap that nothing ever fills.
    let orphan = Operation::insert(0, "x", remote_author).with_base(5).with_seq(5);
    transport
        .push(Envelope::operation(remote_author, doc, &orphan))
        .await;

    // The session surfaces the timeout, then recovers via resync.
    let err = wait_for_event(&mut events, 5, |e| matches!(e, SessionEvent::Error(_))).await;
    match err {
        SessionEvent::Error(e) => assert_eq!(e, SyncError::Timeout),
        _ => unreachable!(),
    }
    let loaded = wait_for_event(&mut events, 5, |e| {
        matches!(e, SessionEvent::DocumentLoaded(_))
    })
    .await;
    match loaded {
        SessionEvent::DocumentLoaded(snap) => assert_eq!(snap.content, "ab"),
        _ => unreachable!(),
    }
    assert_eq!(handle.snapshot().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_leave_flushes_pending_and_announces() {
    let authority = Arc::new(LocalAuthority::new());
    let doc = Uuid::new_v4();
    authority.seed_document(doc, "hi", 1).await;

    let (handle, _events) = join(&authority, doc, "Alice").await;
    handle
        .apply_edit(Edit::Insert {
            position: 2,
            text: "!".into(),
        })
        .await
        .unwrap();

    timeout(Duration::from_secs(5), handle.leave())
        .await
        .expect("leave must not hang")
        .unwrap();

    let (content, _) = authority.document(doc).await.unwrap();
    assert_eq!(content, "hi!");
}
