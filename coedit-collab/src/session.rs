//! Per-document session: connection lifecycle, edit submission, reconnect
//! with backoff, and ordered event delivery.
//!
//! ```text
//! SessionHandle ── commands ──► DocumentSession (one task per document)
//!                                  │  DocumentState + PresenceTracker
//!   apply_edit / update_cursor     │
//!   leave / resync / metrics       ├──► transport.send
//!                                  ◄─── transport stream (ordered ops,
//!                                  │         presence, echo-acks)
//!   events ◄───────────────────────┘
//! ```
//!
//! All mutations of one document's state happen inside its session task,
//! strictly sequentially; different documents run in parallel tasks. Events
//! go out through a single bounded channel per document — one event per
//! state transition, in transition order.
//!
//! On transport loss the session retries with exponential backoff and, once
//! reconnected, always fetches a fresh snapshot instead of replaying its
//! queue blindly: the authority may have moved arbitrarily far while we were
//! gone. Local edits made while disconnected keep accumulating in the
//! pending queue and go through the rebase-or-conflict path on recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use coedit_core::{
    Conflict, DocumentSnapshot, DocumentState, EngineError, Operation, RemoteOutcome, SyncState,
};

use crate::metrics::{MetricsAggregator, MetricsRecorder, SessionMetrics};
use crate::presence::{
    CollaboratorPresence, PresenceChange, PresenceConfig, PresenceDelta, PresenceTracker, Range,
    UserProfile,
};
use crate::protocol::{Envelope, MessageType, ProtocolError};
use crate::transport::{SnapshotStore, Transport, TransportError};

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Backoff multiplier per failed attempt.
    pub reconnect_factor: u32,
    /// Ceiling on the reconnect delay.
    pub reconnect_cap: Duration,
    /// Give up after this many failed attempts.
    pub max_reconnect_attempts: u32,
    /// How long an out-of-order gap may stay open before a forced resync.
    pub buffer_gap_timeout: Duration,
    /// Idle-connection ping cadence.
    pub heartbeat_interval: Duration,
    /// Snapshot checkpoint cadence.
    pub checkpoint_interval: Duration,
    /// Metrics recompute cadence.
    pub metrics_interval: Duration,
    /// Event channel depth.
    pub event_capacity: usize,
    /// Hard cap on queued unacknowledged edits (offline included).
    pub max_pending: usize,
    pub presence: PresenceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_factor: 2,
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            buffer_gap_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(5),
            event_capacity: 256,
            max_pending: 10_000,
            presence: PresenceConfig::default(),
        }
    }
}

/// Collaboration-layer errors: the engine and transport taxonomies plus the
/// failures only a session can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Engine(EngineError),
    Transport(TransportError),
    Protocol(ProtocolError),
    /// An ordered-stream gap stayed open too long, or retries ran out.
    Timeout,
    /// The pending queue hit its cap; the edit was refused.
    PendingLimit,
    /// The session task is gone.
    SessionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Engine(e) => write!(f, "{e}"),
            SyncError::Transport(e) => write!(f, "{e}"),
            SyncError::Protocol(e) => write!(f, "{e}"),
            SyncError::Timeout => write!(f, "synchronization timed out"),
            SyncError::PendingLimit => write!(f, "pending edit queue is full"),
            SyncError::SessionClosed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<EngineError> for SyncError {
    fn from(e: EngineError) -> Self {
        SyncError::Engine(e)
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

/// Everything a session can tell its subscriber, delivered in transition
/// order through one channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    UserJoined(UserProfile),
    UserLeft(Uuid),
    DocumentLoaded(DocumentSnapshot),
    DocumentUpdated { content: String, version: u64 },
    RemoteCursor { user_id: Uuid, position: Option<u64> },
    RemoteSelection { user_id: Uuid, range: Option<Range> },
    Conflict(Conflict),
    Error(SyncError),
}

/// A user edit, before it is stamped into an [`Operation`].
#[derive(Debug, Clone)]
pub enum Edit {
    Insert { position: u64, text: String },
    Delete { position: u64, length: u64 },
}

enum Command {
    Edit {
        edit: Edit,
        base: Option<u64>,
        reply: oneshot::Sender<Result<u64, SyncError>>,
    },
    UpdateCursor {
        position: Option<u64>,
    },
    UpdateSelection {
        range: Option<Range>,
    },
    Collaborators {
        reply: oneshot::Sender<Vec<CollaboratorPresence>>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    Resync {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Reconnect,
    Leave {
        reply: oneshot::Sender<()>,
    },
}

enum LinkState {
    Connected,
    Reconnecting { attempt: u32, next: Instant },
    /// Retries exhausted; only an explicit resync or leave moves on.
    Failed,
}

/// Caller-facing handle to one document session. Cheap to share behind an
/// `Arc`; all methods take `&self`.
pub struct SessionHandle {
    doc_id: Uuid,
    profile: UserProfile,
    commands: mpsc::Sender<Command>,
    events: std::sync::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    metrics: MetricsAggregator,
}

impl SessionHandle {
    /// Join a document: subscribe, fetch the authoritative snapshot,
    /// announce presence, and spawn the session task.
    pub async fn join(
        doc_id: Uuid,
        profile: UserProfile,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let recorder = Arc::new(MetricsRecorder::new());
        let metrics = MetricsAggregator::spawn(
            recorder.clone(),
            transport.clone(),
            config.metrics_interval,
        );

        let stream = transport.subscribe(doc_id).await?;

        let mut doc = DocumentState::new();
        doc.begin_loading();
        let snapshot = store.load_snapshot(doc_id).await?;
        doc.complete_load(snapshot.content.clone(), snapshot.version);

        let presence = PresenceTracker::new(profile.clone(), config.presence.clone());
        transport
            .send(
                doc_id,
                Envelope::presence(profile.user_id, doc_id, &presence.join_delta()),
            )
            .await?;

        let _ = event_tx.send(SessionEvent::Connected).await;
        let _ = event_tx.send(SessionEvent::DocumentLoaded(snapshot)).await;
        log::info!("{} joined document {doc_id}", profile.display_name);

        let session = DocumentSession {
            doc_id,
            doc,
            presence,
            transport,
            store,
            config,
            events: event_tx,
            recorder,
            stream,
            link: LinkState::Connected,
            local_seq: 0,
            sent_at: None,
            buffering_since: None,
            last_send: Instant::now(),
            last_checkpoint: Instant::now(),
        };
        tokio::spawn(session.run(cmd_rx));

        Ok(Self {
            doc_id,
            profile,
            commands: cmd_tx,
            events: std::sync::Mutex::new(Some(event_rx)),
            metrics,
        })
    }

    /// Submit an edit against the current document version.
    pub async fn apply_edit(&self, edit: Edit) -> Result<u64, SyncError> {
        self.submit(edit, None).await
    }

    /// Submit an edit against an explicit base version. Returns
    /// `StaleVersion` if the document has moved on; rebase and resubmit.
    pub async fn apply_edit_at(&self, edit: Edit, base_version: u64) -> Result<u64, SyncError> {
        self.submit(edit, Some(base_version)).await
    }

    async fn submit(&self, edit: Edit, base: Option<u64>) -> Result<u64, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Edit { edit, base, reply })
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn update_cursor(&self, position: Option<u64>) -> Result<(), SyncError> {
        self.commands
            .send(Command::UpdateCursor { position })
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn update_selection(&self, range: Option<Range>) -> Result<(), SyncError> {
        self.commands
            .send(Command::UpdateSelection { range })
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Presence snapshot of everyone in the document.
    pub async fn collaborators(&self) -> Result<Vec<CollaboratorPresence>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Collaborators { reply })
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Immutable copy of the current content and version.
    pub async fn snapshot(&self) -> Result<DocumentSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Drop the current link and reconnect: fresh subscription, fresh
    /// snapshot, pending edits rebased or surfaced as conflicts. The same
    /// path the session takes on its own after a transport failure.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Reconnect)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Explicit full resync: reload the canonical snapshot and offer back
    /// whatever pending edits survive. Required after `Diverged`.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Resync { reply })
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Leave the document: best-effort flush of pending edits, presence
    /// leave, final checkpoint, then stop the task.
    pub async fn leave(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Leave { reply }).await.is_err() {
            return Ok(()); // already gone
        }
        let _ = rx.await;
        Ok(())
    }

    /// Latest metrics rollup. Read-only, never blocks the edit path.
    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.metrics()
    }

    /// Take the event stream. Yields `None` on second call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.metrics.shutdown();
    }
}

/// The per-document actor. Owns the `DocumentState` and the presence map;
/// nothing else ever touches them.
struct DocumentSession {
    doc_id: Uuid,
    doc: DocumentState,
    presence: PresenceTracker,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    recorder: Arc<MetricsRecorder>,
    stream: mpsc::Receiver<Envelope>,
    link: LinkState,
    local_seq: u64,
    /// When the in-flight operation went out, for the RTT rollup.
    sent_at: Option<Instant>,
    /// When the ordered stream first showed a gap.
    buffering_since: Option<Instant>,
    last_send: Instant,
    last_checkpoint: Instant,
}

impl DocumentSession {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let reconnect_at = match self.link {
                LinkState::Reconnecting { next, .. } => next,
                // Far future; the branch below is disabled anyway.
                _ => Instant::now() + Duration::from_secs(3600),
            };
            let reconnecting = matches!(self.link, LinkState::Reconnecting { .. });
            let connected = matches!(self.link, LinkState::Connected);

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        // Every handle dropped without an explicit leave.
                        self.shutdown().await;
                        break;
                    }
                },
                msg = self.stream.recv(), if connected => match msg {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => self.link_lost("subscription stream closed").await,
                },
                _ = tokio::time::sleep_until(reconnect_at), if reconnecting => {
                    self.try_reconnect().await;
                }
                _ = tick.tick() => self.housekeeping().await,
            }
        }
    }

    /// Returns true when the session should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Edit { edit, base, reply } => {
                let result = self.apply_edit(edit, base).await;
                let _ = reply.send(result);
            }
            Command::UpdateCursor { position } => {
                if let Some(delta) = self.presence.update_local_cursor(position) {
                    self.send_presence(&delta).await;
                }
            }
            Command::UpdateSelection { range } => {
                let delta = self.presence.update_local_selection(range);
                self.send_presence(&delta).await;
            }
            Command::Collaborators { reply } => {
                let _ = reply.send(self.presence.collaborators());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.doc.snapshot());
            }
            Command::Resync { reply } => {
                let _ = reply.send(self.resync_from_store().await);
            }
            Command::Reconnect => {
                if matches!(self.link, LinkState::Connected) {
                    self.emit(SessionEvent::Disconnected).await;
                }
                self.sent_at = None;
                self.link = LinkState::Reconnecting {
                    attempt: 0,
                    next: Instant::now(),
                };
            }
            Command::Leave { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn apply_edit(&mut self, edit: Edit, base: Option<u64>) -> Result<u64, SyncError> {
        if self.doc.pending_len() >= self.config.max_pending {
            log::warn!("document {}: pending queue full, edit refused", self.doc_id);
            return Err(SyncError::PendingLimit);
        }

        let author = self.presence.local_profile().user_id;
        let base = base.unwrap_or_else(|| self.doc.version());
        self.local_seq += 1;
        let op = match edit {
            Edit::Insert { position, text } => Operation::insert(position, text, author),
            Edit::Delete { position, length } => Operation::delete(position, length, author),
        }
        .with_base(base)
        .with_seq(self.local_seq);

        match self.doc.apply_local(op) {
            Ok(version) => {
                self.recorder.record_op();
                self.emit(SessionEvent::DocumentUpdated {
                    content: self.doc.content().to_string(),
                    version,
                })
                .await;
                self.pump_send().await;
                Ok(version)
            }
            Err(e) => {
                self.local_seq -= 1;
                Err(SyncError::Engine(e))
            }
        }
    }

    /// Hand the next pending operation to the transport, one in flight at a
    /// time.
    async fn pump_send(&mut self) {
        if !matches!(self.link, LinkState::Connected) {
            return; // pending keeps queueing; reconnect drains it
        }
        if let Some(op) = self.doc.next_to_send() {
            let envelope = Envelope::operation(op.author, self.doc_id, &op);
            self.sent_at = Some(Instant::now());
            self.last_send = Instant::now();
            if let Err(e) = self.transport.send(self.doc_id, envelope).await {
                self.link_lost(&e.to_string()).await;
            }
        }
    }

    async fn send_presence(&mut self, delta: &PresenceDelta) {
        if !matches!(self.link, LinkState::Connected) {
            return; // presence is droppable while offline
        }
        let sender = self.presence.local_profile().user_id;
        let envelope = Envelope::presence(sender, self.doc_id, delta);
        self.last_send = Instant::now();
        if let Err(e) = self.transport.send(self.doc_id, envelope).await {
            self.link_lost(&e.to_string()).await;
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Operation => match envelope.operation_payload() {
                Ok(op) => self.handle_remote_op(op).await,
                Err(e) => log::warn!("undecodable operation envelope: {e}"),
            },
            MessageType::Presence => match envelope.presence_payload() {
                Ok(delta) => {
                    let change = self.presence.handle_delta(&delta);
                    if let Some(change) = change {
                        // A newly seen peer missed our join announcement;
                        // repeat it so discovery is mutual.
                        if matches!(change, PresenceChange::Joined(_)) {
                            let join = self.presence.join_delta();
                            self.send_presence(&join).await;
                        }
                        let event = match change {
                            PresenceChange::Joined(profile) => SessionEvent::UserJoined(profile),
                            PresenceChange::Left(user_id) => SessionEvent::UserLeft(user_id),
                            PresenceChange::Cursor { user_id, position } => {
                                SessionEvent::RemoteCursor { user_id, position }
                            }
                            PresenceChange::Selection { user_id, range } => {
                                SessionEvent::RemoteSelection { user_id, range }
                            }
                        };
                        self.emit(event).await;
                    }
                }
                Err(e) => log::debug!("undecodable presence envelope: {e}"),
            },
            MessageType::Ping => {} // the authority answers pings
            MessageType::Pong => log::trace!("pong from authority"),
        }
    }

    /// Feed one authority-ordered operation through the store, then drain
    /// whatever buffered operations became contiguous.
    async fn handle_remote_op(&mut self, op: Operation) {
        if self.doc.sync_state() == SyncState::Diverged {
            // Already surfaced; nothing applies until an explicit resync.
            log::trace!("document {}: dropping remote op while diverged", self.doc_id);
            return;
        }
        let mut next = Some(op);
        while let Some(op) = next.take() {
            match self.doc.apply_remote(&op) {
                Ok(RemoteOutcome::Applied { version, conflicts }) => {
                    self.recorder.record_op();
                    if !conflicts.is_empty() {
                        self.recorder.record_conflicts(conflicts.len() as u64);
                        for conflict in conflicts {
                            self.emit(SessionEvent::Conflict(conflict)).await;
                        }
                    }
                    self.emit(SessionEvent::DocumentUpdated {
                        content: self.doc.content().to_string(),
                        version,
                    })
                    .await;
                }
                Ok(RemoteOutcome::AckedLocal { .. }) => {
                    if !self.doc.has_in_flight() {
                        if let Some(at) = self.sent_at.take() {
                            self.recorder.record_rtt(at.elapsed().as_millis() as u64);
                        }
                        self.pump_send().await;
                    }
                }
                Ok(RemoteOutcome::Buffered) => {
                    if self.buffering_since.is_none() {
                        self.buffering_since = Some(Instant::now());
                        log::debug!("document {}: out-of-order remote op buffered", self.doc_id);
                    }
                }
                Ok(RemoteOutcome::Duplicate) => {
                    log::trace!("duplicate remote op ignored");
                }
                Err(e) => {
                    log::error!("document {} diverged: {e}", self.doc_id);
                    self.emit(SessionEvent::Error(SyncError::Engine(e))).await;
                    return;
                }
            }
            if !self.doc.is_buffering() {
                self.buffering_since = None;
            }
            next = self.doc.take_ready_buffered();
        }
    }

    async fn housekeeping(&mut self) {
        for (user_id, status) in self.presence.sweep() {
            log::debug!("presence: {user_id} is now {}", status.as_str());
        }
        self.recorder.set_active_users(self.presence.active_count());

        // An unfilled gap in the ordered stream forces a resync.
        if let Some(since) = self.buffering_since {
            if since.elapsed() >= self.config.buffer_gap_timeout {
                log::warn!(
                    "document {}: remote stream gap open for {:?}, forcing resync",
                    self.doc_id,
                    since.elapsed()
                );
                self.buffering_since = None;
                self.emit(SessionEvent::Error(SyncError::Timeout)).await;
                if let Err(e) = self.resync_from_store().await {
                    self.emit(SessionEvent::Error(e)).await;
                }
            }
        }

        if matches!(self.link, LinkState::Connected) {
            if self.last_send.elapsed() >= self.config.heartbeat_interval {
                self.last_send = Instant::now();
                let author = self.presence.local_profile().user_id;
                if let Err(e) = self
                    .transport
                    .send(self.doc_id, Envelope::ping(author, self.doc_id))
                    .await
                {
                    self.link_lost(&e.to_string()).await;
                    return;
                }
            }

            if self.last_checkpoint.elapsed() >= self.config.checkpoint_interval
                && self.doc.sync_state() == SyncState::Synced
            {
                self.last_checkpoint = Instant::now();
                let snap = self.doc.snapshot();
                if let Err(e) = self
                    .store
                    .save_snapshot(self.doc_id, &snap.content, snap.version)
                    .await
                {
                    log::warn!("checkpoint save for {} failed: {e}", self.doc_id);
                }
            }
        }
    }

    async fn link_lost(&mut self, why: &str) {
        if matches!(self.link, LinkState::Reconnecting { .. }) {
            return;
        }
        log::warn!("document {}: transport lost: {why}", self.doc_id);
        self.sent_at = None;
        self.emit(SessionEvent::Disconnected).await;
        self.link = LinkState::Reconnecting {
            attempt: 0,
            next: Instant::now() + self.config.reconnect_base,
        };
    }

    async fn try_reconnect(&mut self) {
        let attempt = match self.link {
            LinkState::Reconnecting { attempt, .. } => attempt + 1,
            _ => return,
        };
        log::info!(
            "document {}: reconnect attempt {attempt}/{}",
            self.doc_id,
            self.config.max_reconnect_attempts
        );

        match self.rejoin().await {
            Ok(()) => {}
            Err(e) => {
                if attempt >= self.config.max_reconnect_attempts {
                    log::error!(
                        "document {}: giving up after {attempt} reconnect attempts: {e}",
                        self.doc_id
                    );
                    self.link = LinkState::Failed;
                    self.emit(SessionEvent::Error(SyncError::Timeout)).await;
                } else {
                    let delay = self.backoff_delay(attempt);
                    self.link = LinkState::Reconnecting {
                        attempt,
                        next: Instant::now() + delay,
                    };
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.config.reconnect_base;
        for _ in 1..attempt {
            delay = (delay * self.config.reconnect_factor).min(self.config.reconnect_cap);
        }
        delay.min(self.config.reconnect_cap)
    }

    /// Fresh subscription, fresh snapshot, rebase-or-surface the queue.
    /// Every fallible step happens before the link flips to connected, so a
    /// failed attempt never emits a `Connected` it has to take back.
    async fn rejoin(&mut self) -> Result<(), SyncError> {
        let stream = self.transport.subscribe(self.doc_id).await?;
        let snapshot = self.store.load_snapshot(self.doc_id).await?;
        let join = self.presence.join_delta();
        let sender = self.presence.local_profile().user_id;
        self.transport
            .send(self.doc_id, Envelope::presence(sender, self.doc_id, &join))
            .await?;

        self.stream = stream;
        self.link = LinkState::Connected;
        self.last_send = Instant::now();
        self.emit(SessionEvent::Connected).await;
        self.install_snapshot(snapshot).await;
        Ok(())
    }

    /// Shared tail of reconnect, forced resync, and explicit resync: install
    /// the authoritative snapshot, surface what the rebase dropped, and get
    /// the send pump moving again.
    async fn install_snapshot(&mut self, snapshot: DocumentSnapshot) {
        let dropped = self.doc.resync(snapshot.content, snapshot.version);
        self.sent_at = None;
        self.buffering_since = None;

        for conflict in dropped {
            self.recorder.record_conflicts(1);
            self.emit(SessionEvent::Conflict(conflict)).await;
        }
        self.emit(SessionEvent::DocumentLoaded(self.doc.snapshot()))
            .await;
        self.pump_send().await;
    }

    async fn resync_from_store(&mut self) -> Result<(), SyncError> {
        if matches!(self.link, LinkState::Failed) {
            // A manual resync revives a failed link.
            self.link = LinkState::Reconnecting {
                attempt: 0,
                next: Instant::now(),
            };
            return Ok(());
        }
        let snapshot = self.store.load_snapshot(self.doc_id).await?;
        self.install_snapshot(snapshot).await;
        Ok(())
    }

    /// Best-effort drain, presence leave, final checkpoint.
    async fn shutdown(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.doc.pending_len() > 0 && matches!(self.link, LinkState::Connected) {
            self.pump_send().await;
            match tokio::time::timeout_at(deadline, self.stream.recv()).await {
                Ok(Some(envelope)) => self.handle_envelope(envelope).await,
                _ => {
                    log::warn!(
                        "document {}: leaving with {} unflushed pending ops",
                        self.doc_id,
                        self.doc.pending_len()
                    );
                    break;
                }
            }
        }

        if matches!(self.link, LinkState::Connected) {
            let leave = self.presence.leave_delta();
            let sender = self.presence.local_profile().user_id;
            let _ = self
                .transport
                .send(self.doc_id, Envelope::presence(sender, self.doc_id, &leave))
                .await;
            let snap = self.doc.snapshot();
            let _ = self
                .store
                .save_snapshot(self.doc_id, &snap.content, snap.version)
                .await;
        }
        self.emit(SessionEvent::Disconnected).await;
        log::info!(
            "{} left document {}",
            self.presence.local_profile().display_name,
            self.doc_id
        );
    }

    async fn emit(&self, event: SessionEvent) {
        // One bounded, ordered channel per document; a dropped receiver
        // just means nobody is listening anymore.
        let _ = self.events.send(event).await;
    }
}
