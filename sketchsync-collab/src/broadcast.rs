//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames. A receiver that falls further behind is told how many frames it
//! missed and must resynchronize from the engine (see `server`).
//!
//! Frames carry their origin so a connection can drop its own echo without
//! decoding the payload.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sketchsync_core::ClientId;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded message in flight.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: ClientId,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers
    pub messages_lagged: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<ClientId, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per peer before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and subscribe it.
    ///
    /// Returns `None` if a peer with the same id is already registered.
    pub async fn add_peer(&self, info: PeerInfo) -> Option<broadcast::Receiver<Frame>> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&info.peer_id) {
            return None;
        }
        peers.insert(info.peer_id, info);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &ClientId) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every subscriber, the sender included.
    /// Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, bytes))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: ClientId, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a receiver skipped after falling behind.
    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &ClientId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
