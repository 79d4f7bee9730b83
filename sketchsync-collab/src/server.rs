//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── SnapshotStore
//!            ├── Room (room_id) ── DocumentEngine ┤   (RocksDB / memory)
//! Client B ──┘         │                         └── on evict / shutdown
//!                      │
//!               BroadcastGroup + PresenceTracker
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! Each connection is one task selecting over socket reads, room broadcast
//! frames and a heartbeat tick. A maintenance task evicts idle rooms and
//! expires stale presence.
//!
//! Any malformed or out-of-order message gets an `Error` reply and the
//! connection is closed. The room is unaffected.

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sketchsync_core::{ClientId, StateVector};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::broadcast::Frame;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{Room, RoomConfig, RoomError, RoomManager};
use crate::room_id::RoomId;
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError};

type ConnError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval; peers silent for three intervals are dropped
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long an empty room stays loaded
    pub idle_grace_secs: u64,
    pub presence_timeout_secs: u64,
    /// Period of the eviction and presence sweeps
    pub sweep_interval_ms: u64,
    /// Largest accepted binary frame
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            idle_grace_secs: 60,
            presence_timeout_secs: 30,
            sweep_interval_ms: 1000,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Fast sweeps and immediate eviction, in-memory storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 5,
            storage_path: None,
            idle_grace_secs: 0,
            presence_timeout_secs: 1,
            sweep_interval_ms: 100,
            max_frame_bytes: 1024 * 1024,
        }
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers_per_room: self.max_peers_per_room,
            idle_grace: Duration::from_secs(self.idle_grace_secs),
            presence_timeout: Duration::from_secs(self.presence_timeout_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    /// Connections closed for protocol violations
    pub rejected: u64,
    /// Catch-ups sent to peers that lagged behind the broadcast channel
    pub lag_resyncs: u64,
}

#[derive(Clone)]
struct Shared {
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    config: Arc<ServerConfig>,
}

/// Per-connection state after a successful `Join`.
struct Session {
    peer: PeerInfo,
    room: Arc<Room>,
    rx: broadcast::Receiver<Frame>,
    /// Everything up to this vector is known to have reached the peer
    delivered: StateVector,
}

enum Outcome {
    Continue,
    Close,
}

fn binary(msg: &SyncMessage) -> Result<Message, ProtocolError> {
    Ok(Message::Binary(msg.encode()?.into()))
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with an explicit snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let rooms = Arc::new(RoomManager::new(store, config.room_config()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> Result<(), ConnError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves, then flush every room.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ConnError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ConnError>
    where
        F: Future<Output = ()>,
    {
        let maintenance = self.spawn_maintenance();
        let shared = Shared {
            rooms: self.rooms.clone(),
            stats: self.stats.clone(),
            config: Arc::new(self.config.clone()),
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        maintenance.abort();
        let _ = maintenance.await;
        let saved = self.rooms.flush_all().await?;
        log::info!("Sync server stopped, {saved} rooms flushed");
        Ok(())
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let rooms = self.rooms.clone();
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                rooms.sweep_presence().await;
                let evicted = rooms.evict_idle().await;
                if !evicted.is_empty() {
                    log::debug!("Evicted {} idle rooms", evicted.len());
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), ConnError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = None;
        let result =
            Self::drive(&shared, addr, &mut ws_sender, &mut ws_receiver, &mut session).await;

        if let Some(session) = session {
            Self::finish_session(session, &shared).await;
        }
        shared.stats.write().await.active_connections -= 1;
        result
    }

    async fn drive<S, R>(
        shared: &Shared,
        addr: SocketAddr,
        sink: &mut S,
        stream: &mut R,
        session: &mut Option<Session>,
    ) -> Result<(), ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let heartbeat_every = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if let Outcome::Close = Self::handle_frame(shared, sink, session, bytes).await? {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(_)) => {
                            let joined = session.as_ref().map(|s| s.room.id().clone());
                            let err = ProtocolError::NonBinaryFrame;
                            Self::reject(shared, sink, joined.as_ref(), err).await?;
                            break;
                        }
                    }
                }

                frame = async {
                    match session.as_mut() {
                        Some(active) => active.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(active) = session.as_mut() else { continue };
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == active.peer.peer_id {
                                continue;
                            }
                            sink.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            Self::resync(shared, sink, active, skipped).await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_every * 3 {
                        log::info!("Peer at {addr} timed out");
                        break;
                    }
                    sink.send(Message::Ping(Default::default())).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame<S>(
        shared: &Shared,
        sink: &mut S,
        session: &mut Option<Session>,
        bytes: Vec<u8>,
    ) -> Result<Outcome, ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let joined_room = session.as_ref().map(|s| s.room.id().clone());
        if bytes.len() > shared.config.max_frame_bytes {
            let err = ProtocolError::FrameTooLarge(bytes.len());
            return Self::reject(shared, sink, joined_room.as_ref(), err).await;
        }
        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => return Self::reject(shared, sink, joined_room.as_ref(), e).await,
        };
        {
            let mut s = shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        let Some(active) = session.as_mut() else {
            return match msg.msg_type {
                MessageType::Join => match Self::register(shared, sink, &msg).await? {
                    Some(joined) => {
                        let active = session.insert(joined);
                        Self::welcome(shared, sink, active).await?;
                        Ok(Outcome::Continue)
                    }
                    None => Ok(Outcome::Close),
                },
                MessageType::Ping => {
                    sink.send(binary(&SyncMessage::pong(ClientId::nil(), &msg.room_id))?)
                        .await?;
                    Ok(Outcome::Continue)
                }
                other => {
                    let err = ProtocolError::UnexpectedMessage(other);
                    Self::reject(shared, sink, Some(&msg.room_id), err).await
                }
            };
        };

        let room_id = active.room.id().clone();
        if msg.room_id != room_id {
            let err = ProtocolError::RoomMismatch(msg.room_id.clone());
            return Self::reject(shared, sink, Some(&room_id), err).await;
        }
        if msg.peer_id != active.peer.peer_id && msg.msg_type != MessageType::Ping {
            return Self::reject(shared, sink, Some(&room_id), ProtocolError::InvalidPeer).await;
        }

        match msg.msg_type {
            MessageType::Delta => {
                let ops = match msg.operations() {
                    Ok(ops) => ops,
                    Err(e) => return Self::reject(shared, sink, Some(&room_id), e).await,
                };
                if ops.is_empty() {
                    return Ok(Outcome::Continue);
                }
                match active.room.apply_remote(ops).await {
                    Ok(applied) => {
                        log::debug!(
                            "Room {}: {} new ops from {} ({} superseded, {} duplicate)",
                            room_id,
                            applied.new_ops(),
                            active.peer.peer_id,
                            applied.superseded,
                            applied.duplicate
                        );
                        if applied.new_ops() > 0 {
                            active
                                .room
                                .broadcast()
                                .broadcast_raw(active.peer.peer_id, Arc::new(bytes));
                        }
                    }
                    Err(e) => {
                        let err = ProtocolError::InvalidOperation(e.to_string());
                        return Self::reject(shared, sink, Some(&room_id), err).await;
                    }
                }
            }

            MessageType::SyncStep1 => {
                let remote = match msg.state_vector() {
                    Ok(vector) => vector,
                    Err(e) => return Self::reject(shared, sink, Some(&room_id), e).await,
                };
                let (reply, vector) =
                    Self::catch_up(&active.room, active.peer.peer_id, &remote).await?;
                sink.send(binary(&reply)?).await?;
                active.delivered.merge(&vector);
            }

            MessageType::Presence => {
                let state = match msg.presence_state() {
                    Ok(state) => state,
                    Err(e) => return Self::reject(shared, sink, Some(&room_id), e).await,
                };
                log::trace!("Presence update from {} in room {}", active.peer.peer_id, room_id);
                active
                    .room
                    .presence()
                    .lock()
                    .await
                    .update(active.peer.peer_id, state);
                active
                    .room
                    .broadcast()
                    .broadcast_raw(active.peer.peer_id, Arc::new(bytes));
            }

            MessageType::Ping => {
                sink.send(binary(&SyncMessage::pong(ClientId::nil(), &room_id))?)
                    .await?;
            }

            MessageType::Pong => {}

            MessageType::Leave => {
                log::debug!("Peer {} leaving room {}", active.peer.peer_id, room_id);
                return Ok(Outcome::Close);
            }

            other => {
                let err = ProtocolError::UnexpectedMessage(other);
                return Self::reject(shared, sink, Some(&room_id), err).await;
            }
        }
        Ok(Outcome::Continue)
    }

    /// Validate a `Join` and register the peer. Rejections are sent here.
    async fn register<S>(
        shared: &Shared,
        sink: &mut S,
        msg: &SyncMessage,
    ) -> Result<Option<Session>, ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let request = match msg.join_request() {
            Ok(request) => request,
            Err(e) => {
                Self::reject(shared, sink, Some(&msg.room_id), e).await?;
                return Ok(None);
            }
        };
        let (room, rx) = match shared.rooms.join(&msg.room_id, request.info.clone()).await {
            Ok(joined) => joined,
            Err(e) => {
                Self::reject(shared, sink, Some(&msg.room_id), e).await?;
                return Ok(None);
            }
        };

        // Only this peer issues its own ids, so the room can never be ahead
        // of it unless the replica was lost and the id reused.
        let peer = request.info.peer_id;
        let known = room.engine().lock().await.state_vector().get(&peer);
        let claimed = request.vector.get(&peer);
        if known > claimed {
            drop(rx);
            shared.rooms.leave(&room, &peer).await;
            let err = RoomError::StaleReplica {
                peer,
                known,
                claimed,
            };
            Self::reject(shared, sink, Some(&msg.room_id), err).await?;
            return Ok(None);
        }

        Ok(Some(Session {
            peer: request.info,
            room,
            rx,
            delivered: request.vector,
        }))
    }

    /// Catch-up, current peers and presence for a newly joined peer.
    async fn welcome<S>(shared: &Shared, sink: &mut S, active: &mut Session) -> Result<(), ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let room_id = active.room.id().clone();
        let me = active.peer.peer_id;

        let (reply, vector) = Self::catch_up(&active.room, me, &active.delivered).await?;
        let sent = reply.clock;
        sink.send(binary(&reply)?).await?;
        active.delivered.merge(&vector);

        for info in active.room.broadcast().peers().await {
            if info.peer_id != me {
                sink.send(binary(&SyncMessage::peer_joined(&room_id, &info)?)?)
                    .await?;
            }
        }
        Self::send_presence(sink, active).await?;

        active
            .room
            .broadcast()
            .broadcast(&SyncMessage::peer_joined(&room_id, &active.peer)?)?;

        let room_count = shared.rooms.room_count().await;
        shared.stats.write().await.active_rooms = room_count;
        log::info!(
            "Peer {} ({}) joined room {} (catch-up up to counter {})",
            active.peer.name,
            me,
            room_id,
            sent
        );
        Ok(())
    }

    async fn send_presence<S>(sink: &mut S, active: &Session) -> Result<(), ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let states = active.room.presence().lock().await.snapshot();
        for (peer, state) in states {
            if peer != active.peer.peer_id {
                let msg = SyncMessage::presence(peer, active.room.id(), &state)?;
                sink.send(binary(&msg)?).await?;
            }
        }
        Ok(())
    }

    /// Operations the room has beyond `remote`, with the room's vector.
    ///
    /// Operations issued by `peer` itself are never included: it made them.
    async fn catch_up(
        room: &Room,
        peer: ClientId,
        remote: &StateVector,
    ) -> Result<(SyncMessage, StateVector), ProtocolError> {
        let (ops, vector) = {
            let engine = room.engine().lock().await;
            let mut remote = remote.clone();
            let own = engine.state_vector().get(&peer).max(remote.get(&peer));
            remote.set(peer, own);
            (engine.diff(&remote).into_ops(), engine.state_vector().clone())
        };
        let msg = SyncMessage::sync_step2(ClientId::nil(), room.id(), ops, &vector)?;
        Ok((msg, vector))
    }

    /// Replace frames a lagging peer missed with a catch-up from the engine.
    async fn resync<S>(
        shared: &Shared,
        sink: &mut S,
        active: &mut Session,
        skipped: u64,
    ) -> Result<(), ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        active.room.broadcast().record_lag(skipped);
        log::warn!(
            "Peer {} lagged by {skipped} frames in room {}, resyncing",
            active.peer.peer_id,
            active.room.id()
        );
        let (reply, vector) =
            Self::catch_up(&active.room, active.peer.peer_id, &active.delivered).await?;
        sink.send(binary(&reply)?).await?;
        active.delivered.merge(&vector);
        Self::send_presence(sink, active).await?;
        shared.stats.write().await.lag_resyncs += 1;
        Ok(())
    }

    /// Report a protocol violation and close the channel.
    async fn reject<S>(
        shared: &Shared,
        sink: &mut S,
        room: Option<&RoomId>,
        reason: impl Display,
    ) -> Result<Outcome, ConnError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let reason = reason.to_string();
        log::warn!("Closing connection: {reason}");
        shared.stats.write().await.rejected += 1;

        let code = match room {
            Some(room) => {
                sink.send(binary(&SyncMessage::error(room, reason))?).await?;
                CloseCode::Policy
            }
            // Nothing decodable arrived yet; the close code is the only report
            None => CloseCode::Invalid,
        };
        sink.send(Message::Close(Some(CloseFrame {
            code,
            reason: "protocol violation".into(),
        })))
        .await?;
        Ok(Outcome::Close)
    }

    async fn finish_session(session: Session, shared: &Shared) {
        let Session { peer, room, rx, .. } = session;
        drop(rx);
        if shared.rooms.leave(&room, &peer.peer_id).await {
            if let Err(e) = room
                .broadcast()
                .broadcast(&SyncMessage::leave(peer.peer_id, room.id()))
            {
                log::warn!("Failed to broadcast leave for {}: {e}", peer.peer_id);
            }
        }
        log::info!("Peer {} ({}) left room {}", peer.name, peer.peer_id, room.id());
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
