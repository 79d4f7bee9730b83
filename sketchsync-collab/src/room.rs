//! Room lifecycle: creation, membership, idle eviction.
//!
//! ```text
//!            join                       leave (last peer)
//!  absent ──────────► active ◄────────────────────────────┐
//!    ▲   load snapshot   │  ──────────────► idle ──────────┘ join
//!    │                   │                   │
//!    └───────────────────┴── evict_idle ─────┘ (after grace, snapshot saved)
//! ```
//!
//! Lock order: manager map, then the room's broadcast peers, then the
//! engine. Store I/O never runs while a room's engine lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sketchsync_core::{ApplyStats, ClientId, DocumentEngine, EngineError, Operation, Snapshot};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TIMEOUT};
use crate::protocol::{PeerInfo, SyncMessage};
use crate::room_id::RoomId;
use crate::storage::{SnapshotStore, StoreError};

/// Room manager configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Frames buffered per peer before it lags
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
    /// How long an empty room stays in memory
    pub idle_grace: Duration,
    pub presence_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            idle_grace: Duration::from_secs(60),
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 16,
            max_peers_per_room: 10,
            idle_grace: Duration::ZERO,
            presence_timeout: Duration::from_millis(200),
        }
    }
}

/// One live document with its peers.
pub struct Room {
    id: RoomId,
    engine: Mutex<DocumentEngine>,
    broadcast: BroadcastGroup,
    presence: Mutex<PresenceTracker>,
    idle_since: Mutex<Option<Instant>>,
}

impl Room {
    fn new(id: RoomId, engine: DocumentEngine, config: &RoomConfig) -> Self {
        Self {
            id,
            engine: Mutex::new(engine),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            presence: Mutex::new(PresenceTracker::new(config.presence_timeout)),
            idle_since: Mutex::new(Some(Instant::now())),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// The room's replica. Hold the guard only for in-memory work.
    pub fn engine(&self) -> &Mutex<DocumentEngine> {
        &self.engine
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn presence(&self) -> &Mutex<PresenceTracker> {
        &self.presence
    }

    /// Apply a peer's operations as one batch.
    pub async fn apply_remote(&self, ops: Vec<Operation>) -> Result<ApplyStats, EngineError> {
        self.engine.lock().await.apply_all(ops)
    }

    pub async fn op_count(&self) -> usize {
        self.engine.lock().await.op_count()
    }

    /// Encoded snapshot and the op count it covers.
    pub async fn encode_snapshot(&self) -> Result<(Vec<u8>, usize), EngineError> {
        let snapshot = self.engine.lock().await.encode_state();
        let op_count = snapshot.op_count();
        Ok((snapshot.encode()?, op_count))
    }

    async fn idle_for(&self, grace: Duration) -> bool {
        match *self.idle_since.lock().await {
            Some(since) => since.elapsed() >= grace,
            None => false,
        }
    }
}

/// Owns every live room and the snapshot store behind them.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    fn load_room(&self, id: &RoomId) -> Result<Room, RoomError> {
        let engine = match self.store.load(id)? {
            Some(bytes) => {
                let snapshot = Snapshot::decode(&bytes)?;
                let engine = DocumentEngine::from_snapshot(ClientId::nil(), snapshot)?;
                log::info!("Loaded room {} ({} ops)", id, engine.op_count());
                engine
            }
            None => {
                log::info!("Created room {}", id);
                DocumentEngine::new(ClientId::nil())
            }
        };
        Ok(Room::new(id.clone(), engine, &self.config))
    }

    /// Live room for `id`, loading its snapshot on first use.
    ///
    /// A room returned here may be evicted once idle; connections should use
    /// `join`, which registers the peer atomically.
    pub async fn get_or_create(&self, id: &RoomId) -> Result<Arc<Room>, RoomError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(id) {
            return Ok(room.clone());
        }
        let room = Arc::new(self.load_room(id)?);
        rooms.insert(id.clone(), room.clone());
        Ok(room)
    }

    /// Register a peer, creating the room if needed.
    pub async fn join(
        &self,
        id: &RoomId,
        info: PeerInfo,
    ) -> Result<(Arc<Room>, broadcast::Receiver<Frame>), RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(id) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(self.load_room(id)?);
                rooms.insert(id.clone(), room.clone());
                room
            }
        };

        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            return Err(RoomError::RoomFull(self.config.max_peers_per_room));
        }
        let peer_id = info.peer_id;
        let rx = room
            .broadcast
            .add_peer(info)
            .await
            .ok_or(RoomError::PeerAlreadyJoined(peer_id))?;
        *room.idle_since.lock().await = None;
        Ok((room, rx))
    }

    /// Unregister a peer and drop its presence. Returns true if the peer was
    /// registered.
    pub async fn leave(&self, room: &Room, peer: &ClientId) -> bool {
        let _rooms = self.rooms.read().await;
        let removed = room.broadcast.remove_peer(peer).await.is_some();
        room.presence.lock().await.expire(peer);
        if room.broadcast.peer_count().await == 0 {
            *room.idle_since.lock().await = Some(Instant::now());
            log::debug!("Room {} is idle", room.id);
        }
        removed
    }

    /// Snapshot and release rooms idle past the grace period. Returns the
    /// evicted ids.
    pub async fn evict_idle(&self) -> Vec<RoomId> {
        let grace = self.config.idle_grace;
        let all: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut candidates = Vec::new();
        for room in all {
            if room.idle_for(grace).await {
                candidates.push(room);
            }
        }

        let mut evicted = Vec::new();
        for room in candidates {
            let (bytes, op_count) = match room.encode_snapshot().await {
                Ok(encoded) => encoded,
                Err(e) => {
                    log::warn!("Keeping room {}: snapshot encode failed: {}", room.id, e);
                    continue;
                }
            };
            if op_count > 0 {
                if let Err(e) = self.store.save(&room.id, &bytes) {
                    log::warn!("Keeping room {}: snapshot save failed: {}", room.id, e);
                    continue;
                }
            }

            let mut rooms = self.rooms.write().await;
            let unchanged = room.broadcast.peer_count().await == 0
                && room.idle_for(grace).await
                && room.op_count().await == op_count;
            let current = rooms
                .get(&room.id)
                .is_some_and(|live| Arc::ptr_eq(live, &room));
            if unchanged && current {
                rooms.remove(&room.id);
                log::info!("Evicted room {} ({} ops saved)", room.id, op_count);
                evicted.push(room.id.clone());
            }
        }
        evicted
    }

    /// Drop stale presence in every room and broadcast `Leave` for each.
    pub async fn sweep_presence(&self) -> Vec<(RoomId, ClientId)> {
        let all: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for room in all {
            let stale = room.presence.lock().await.expire_stale();
            for peer in stale {
                log::trace!("Presence of {} in {} expired", peer, room.id);
                if let Err(e) = room.broadcast.broadcast(&SyncMessage::leave(peer, &room.id)) {
                    log::warn!("Failed to broadcast leave: {}", e);
                }
                expired.push((room.id.clone(), peer));
            }
        }
        expired
    }

    /// Save every non-empty room. Every room is attempted; the first
    /// failure is returned.
    pub async fn flush_all(&self) -> Result<usize, RoomError> {
        let all: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut saved = 0;
        let mut first_error = None;
        for room in all {
            let result = match room.encode_snapshot().await {
                Ok((_, 0)) => continue,
                Ok((bytes, _)) => self.store.save(&room.id, &bytes).map_err(RoomError::from),
                Err(e) => Err(RoomError::from(e)),
            };
            match result {
                Ok(()) => saved += 1,
                Err(e) => {
                    log::warn!("Flush of room {} failed: {}", room.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    pub async fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

/// Room manager errors.
#[derive(Debug, Clone)]
pub enum RoomError {
    Store(StoreError),
    /// Stored snapshot could not be restored
    Engine(EngineError),
    RoomFull(usize),
    PeerAlreadyJoined(ClientId),
    /// The room holds more of this peer's operations than its replica does
    StaleReplica {
        peer: ClientId,
        known: u64,
        claimed: u64,
    },
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Engine(e) => write!(f, "Engine error: {e}"),
            Self::RoomFull(max) => write!(f, "Room is full ({max} peers)"),
            Self::PeerAlreadyJoined(id) => write!(f, "Peer {id} is already in the room"),
            Self::StaleReplica {
                peer,
                known,
                claimed,
            } => write!(
                f,
                "Stale replica for peer {peer}: counter {claimed} behind the room's {known} (peer ids must not be reused)"
            ),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<EngineError> for RoomError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}
