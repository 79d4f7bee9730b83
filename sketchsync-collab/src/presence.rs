//! Presence: who is in the room and where they are pointing.
//!
//! Presence is ephemeral. Each update from a peer replaces that peer's
//! previous state wholesale; nothing is merged, persisted, or replayed on
//! reconnect. Entries that stop receiving updates expire, which covers
//! peers that vanish without a clean leave.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! CursorThrottle::should_send()   (30 Hz)
//!       │
//!       ▼
//! SyncMessage::presence(PresenceState)
//!       │
//!       ▼   (WebSocket, best-effort)
//! Server PresenceTracker::update()  ──► broadcast to room
//!       │
//!       ▼
//! expire_stale() sweep ──► Leave
//! ```
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Presence encode | <1µs |
//! | Memory per peer | <1KB |

use serde::{Deserialize, Serialize};
use sketchsync_core::{ClientId, ShapeId};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Default time after which a silent peer's presence is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between outgoing cursor updates (30 Hz).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Position in whiteboard coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// RGBA color for cursor and selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id.
    pub fn from_client(client: ClientId) -> Self {
        let hash = client.as_uuid().as_u128();
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

    /// `#rrggbb` for CSS consumers.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
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

/// Everything a peer advertises about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    /// Peer's chosen color. Renderers fall back to [`CursorColor::from_client`].
    pub color: Option<CursorColor>,
    pub cursor: Option<Point>,
    pub selection: Vec<ShapeId>,
    /// Free-form extras (tool in use, viewport, status text).
    pub fields: BTreeMap<String, String>,
}

impl PresenceState {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Color to draw this peer with.
    pub fn display_color(&self, client: ClientId) -> CursorColor {
        self.color.unwrap_or_else(|| CursorColor::from_client(client))
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PresenceEntry {
    state: PresenceState,
    last_seen: Instant,
}

/// Latest presence per peer with idle expiry.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<ClientId, PresenceEntry>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Replace `peer`'s state and refresh its deadline.
    pub fn update(&mut self, peer: ClientId, state: PresenceState) {
        self.entries.insert(
            peer,
            PresenceEntry {
                state,
                last_seen: Instant::now(),
            },
        );
    }

    /// Remove `peer` immediately (clean disconnect).
    pub fn expire(&mut self, peer: &ClientId) -> Option<PresenceState> {
        self.entries.remove(peer).map(|entry| entry.state)
    }

    /// Drop entries idle longer than the timeout. Returns the removed peers.
    pub fn expire_stale(&mut self) -> Vec<ClientId> {
        let timeout = self.timeout;
        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn get(&self, peer: &ClientId) -> Option<&PresenceState> {
        self.entries.get(peer).map(|entry| &entry.state)
    }

    /// Current states, ordered by client id.
    pub fn snapshot(&self) -> Vec<(ClientId, PresenceState)> {
        let mut all: Vec<(ClientId, PresenceState)> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.state.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}

// ───────────────────────────────────────────────────────────────────
// Outgoing rate limit
// ───────────────────────────────────────────────────────────────────

/// Rate limiter for outgoing cursor updates.
///
/// Selection and profile changes should bypass it; only pointer motion is
/// high-frequency enough to need throttling.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a cursor update may go out now. Records the send if so.
    pub fn should_send(&mut self) -> bool {
        match self.last_sent {
            Some(last) if last.elapsed() < self.interval => false,
            _ => {
                self.last_sent = Some(Instant::now());
                true
            }
        }
    }

    /// Record a send that bypassed the throttle.
    pub fn mark_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_INTERVAL)
    }
}
