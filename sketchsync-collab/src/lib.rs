//! # sketchsync-collab — Rooms, sync transport and persistence
//!
//! Serves [`sketchsync_core::DocumentEngine`] replicas to peers over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Document    │                     │ RoomManager │──► SnapshotStore
//! │ Engine      │                     │  └ Room     │
//! │ (local)     │                     │    ├ Engine │
//! └─────────────┘                     │    ├ Fanout │
//!                                     │    └ Presence
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Per-room fan-out with lag detection
//! - [`room`] — Room lifecycle, idle eviction, snapshots
//! - [`presence`] — Ephemeral cursors and selections
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with reconnect
//! - [`storage`] — RocksDB and in-memory snapshot stores
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Delta serialization (1 op) | <1µs |
//! | Broadcast 1K frames × 100 peers | <10ms |
//! | Reconnect catch-up (10K ops) | <50ms |

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod room_id;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use presence::{CursorColor, CursorThrottle, Point, PresenceState, PresenceTracker};
pub use protocol::{CatchUp, JoinRequest, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use room::{Room, RoomConfig, RoomError, RoomManager};
pub use room_id::{RoomId, RoomIdError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentStore, MemoryStore, RoomMetadata, SnapshotStore, StoreConfig, StoreError,
};
