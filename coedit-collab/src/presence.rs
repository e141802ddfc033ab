//! Presence: who is in the document, where their cursor is, what they have
//! selected.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_local_cursor()   (throttled, 30 Hz)
//!       │
//!       ▼
//! PresenceDelta ──► Envelope::presence ──► transport fan-out
//!                                               │
//!                                               ▼
//!                              remote PresenceTracker::handle_delta()
//!                                  (last-write-wins per field)
//! ```
//!
//! Presence bypasses the transform pipeline entirely: deltas are not
//! order-sensitive, each field resolves by sender timestamp, and none of it
//! ever affects document correctness. The liveness sweep that demotes quiet
//! collaborators to Idle/Away/Offline is advisory UI state only.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast protocols.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coedit_core::epoch_millis;

/// RGBA color used to paint a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl UserColor {
    /// Generate a stable, visually distinct color from a user id.
    ///
    /// High-saturation HSL keyed on the id hash, so the same user renders
    /// the same color on every peer without coordination.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A collaborator's identity, as handed out by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: UserColor,
}

impl UserProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        let user_id = Uuid::new_v4();
        Self {
            user_id,
            display_name: display_name.into(),
            color: UserColor::from_uuid(user_id),
        }
    }

    /// Create with an explicit user id (stable identity, tests).
    pub fn with_id(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: UserColor::from_uuid(user_id),
        }
    }
}

/// A selection range in codepoint offsets, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Liveness classification, advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Active => "active",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

/// Everything we track about one collaborator in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorPresence {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: UserColor,
    pub cursor: Option<u64>,
    pub selection: Option<Range>,
    /// Epoch millis of the last delta we saw from this user.
    pub last_seen: u64,
    pub status: PresenceStatus,
}

impl CollaboratorPresence {
    fn from_profile(profile: &UserProfile) -> Self {
        Self {
            user_id: profile.user_id,
            display_name: profile.display_name.clone(),
            color: profile.color,
            cursor: None,
            selection: None,
            last_seen: epoch_millis(),
            status: PresenceStatus::Active,
        }
    }
}

/// Presence wire messages. Cursor and selection updates carry the sender's
/// monotonic timestamp; receivers keep the newest value per field and drop
/// the rest, so out-of-order delivery is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceDelta {
    /// Join a document with a user profile.
    Join { profile: UserProfile },
    /// Clean leave.
    Leave { user_id: Uuid },
    /// Cursor moved (or cleared). High frequency, throttled at the source.
    Cursor {
        user_id: Uuid,
        position: Option<u64>,
        timestamp: u64,
    },
    /// Selection changed (or cleared).
    Selection {
        user_id: Uuid,
        range: Option<Range>,
        timestamp: u64,
    },
}

impl PresenceDelta {
    pub fn user_id(&self) -> Uuid {
        match self {
            PresenceDelta::Join { profile } => profile.user_id,
            PresenceDelta::Leave { user_id } => *user_id,
            PresenceDelta::Cursor { user_id, .. } => *user_id,
            PresenceDelta::Selection { user_id, .. } => *user_id,
        }
    }
}

/// What a handled delta changed, for the session to turn into an event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(UserProfile),
    Left(Uuid),
    Cursor {
        user_id: Uuid,
        position: Option<u64>,
    },
    Selection {
        user_id: Uuid,
        range: Option<Range>,
    },
}

/// Liveness thresholds and the cursor broadcast throttle.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum interval between outgoing cursor deltas (30 Hz default).
    pub cursor_interval: Duration,
    /// No update for this long: Active -> Idle.
    pub idle_after: Duration,
    /// No update for this long: Idle -> Away.
    pub away_after: Duration,
    /// No update for this long: reclassified Offline locally, even without
    /// an explicit leave.
    pub offline_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(33),
            idle_after: Duration::from_secs(30),
            away_after: Duration::from_secs(120),
            offline_after: Duration::from_secs(300),
        }
    }
}

struct PeerEntry {
    presence: CollaboratorPresence,
    cursor_ts: u64,
    selection_ts: u64,
    last_update: Instant,
}

impl PeerEntry {
    fn new(presence: CollaboratorPresence) -> Self {
        Self {
            presence,
            cursor_ts: 0,
            selection_ts: 0,
            last_update: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_update = Instant::now();
        self.presence.last_seen = epoch_millis();
        self.presence.status = PresenceStatus::Active;
    }
}

/// Per-document presence state: the local user's outgoing throttle plus the
/// tracked remote collaborators. Owned by the document's session actor and
/// updated only by it.
pub struct PresenceTracker {
    local: UserProfile,
    peers: HashMap<Uuid, PeerEntry>,
    config: PresenceConfig,
    last_cursor_broadcast: Instant,
    local_cursor: Option<u64>,
    local_selection: Option<Range>,
    /// Monotonic stamp for outgoing deltas.
    timestamp_counter: u64,
}

impl PresenceTracker {
    pub fn new(local: UserProfile, config: PresenceConfig) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            config,
            // Allow an immediate first broadcast.
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            local_cursor: None,
            local_selection: None,
            timestamp_counter: 0,
        }
    }

    /// Handle an incoming presence delta. Returns the change to surface, or
    /// `None` for own echoes and stale (out-of-order) updates.
    pub fn handle_delta(&mut self, delta: &PresenceDelta) -> Option<PresenceChange> {
        if delta.user_id() == self.local.user_id {
            return None;
        }

        match delta {
            PresenceDelta::Join { profile } => {
                // Re-announcements of a known peer just refresh liveness, so
                // mutual-discovery chatter stays quiet.
                if let Some(entry) = self.peers.get_mut(&profile.user_id) {
                    if entry.presence.display_name == profile.display_name {
                        entry.touch();
                        return None;
                    }
                }
                let entry = PeerEntry::new(CollaboratorPresence::from_profile(profile));
                self.peers.insert(profile.user_id, entry);
                Some(PresenceChange::Joined(profile.clone()))
            }

            PresenceDelta::Leave { user_id } => {
                self.peers.remove(user_id);
                Some(PresenceChange::Left(*user_id))
            }

            PresenceDelta::Cursor {
                user_id,
                position,
                timestamp,
            } => {
                let entry = self.entry_or_placeholder(*user_id);
                if *timestamp < entry.cursor_ts {
                    return None; // last write wins
                }
                entry.cursor_ts = *timestamp;
                entry.presence.cursor = *position;
                entry.touch();
                Some(PresenceChange::Cursor {
                    user_id: *user_id,
                    position: *position,
                })
            }

            PresenceDelta::Selection {
                user_id,
                range,
                timestamp,
            } => {
                let entry = self.entry_or_placeholder(*user_id);
                if *timestamp < entry.selection_ts {
                    return None;
                }
                entry.selection_ts = *timestamp;
                entry.presence.selection = *range;
                entry.touch();
                Some(PresenceChange::Selection {
                    user_id: *user_id,
                    range: *range,
                })
            }
        }
    }

    /// A cursor from a peer whose join we never saw (they were here before
    /// we subscribed) gets a placeholder entry.
    fn entry_or_placeholder(&mut self, user_id: Uuid) -> &mut PeerEntry {
        self.peers.entry(user_id).or_insert_with(|| {
            let profile = UserProfile::with_id(user_id, format!("user-{}", &user_id.to_string()[..8]));
            PeerEntry::new(CollaboratorPresence::from_profile(&profile))
        })
    }

    /// Record a local cursor move and produce the delta to broadcast, or
    /// `None` while throttled.
    pub fn update_local_cursor(&mut self, position: Option<u64>) -> Option<PresenceDelta> {
        self.local_cursor = position;
        if self.last_cursor_broadcast.elapsed() < self.config.cursor_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        self.timestamp_counter += 1;
        Some(PresenceDelta::Cursor {
            user_id: self.local.user_id,
            position,
            timestamp: self.timestamp_counter,
        })
    }

    /// Record a local selection change. Selection deltas are never throttled
    /// — they only fire when the selection actually changes.
    pub fn update_local_selection(&mut self, range: Option<Range>) -> PresenceDelta {
        self.local_selection = range;
        self.timestamp_counter += 1;
        PresenceDelta::Selection {
            user_id: self.local.user_id,
            range,
            timestamp: self.timestamp_counter,
        }
    }

    /// The join announcement for the local user.
    pub fn join_delta(&self) -> PresenceDelta {
        PresenceDelta::Join {
            profile: self.local.clone(),
        }
    }

    /// The leave announcement for the local user.
    pub fn leave_delta(&self) -> PresenceDelta {
        PresenceDelta::Leave {
            user_id: self.local.user_id,
        }
    }

    /// Reclassify quiet peers. Returns the ids whose status changed, with
    /// the new status — advisory, never affects document state.
    pub fn sweep(&mut self) -> Vec<(Uuid, PresenceStatus)> {
        let mut changed = Vec::new();
        for (id, entry) in &mut self.peers {
            let quiet = entry.last_update.elapsed();
            let next = if quiet >= self.config.offline_after {
                PresenceStatus::Offline
            } else if quiet >= self.config.away_after {
                PresenceStatus::Away
            } else if quiet >= self.config.idle_after {
                PresenceStatus::Idle
            } else {
                PresenceStatus::Active
            };
            if next != entry.presence.status {
                entry.presence.status = next;
                changed.push((*id, next));
            }
        }
        changed
    }

    /// Snapshot of all tracked collaborators.
    pub fn collaborators(&self) -> Vec<CollaboratorPresence> {
        self.peers.values().map(|e| e.presence.clone()).collect()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&CollaboratorPresence> {
        self.peers.get(user_id).map(|e| &e.presence)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Count of `Active` collaborators, including the local user.
    pub fn active_count(&self) -> usize {
        1 + self
            .peers
            .values()
            .filter(|e| e.presence.status == PresenceStatus::Active)
            .count()
    }

    pub fn local_profile(&self) -> &UserProfile {
        &self.local
    }

    pub fn local_cursor(&self) -> Option<u64> {
        self.local_cursor
    }

    pub fn local_selection(&self) -> Option<Range> {
        self.local_selection
    }
}
