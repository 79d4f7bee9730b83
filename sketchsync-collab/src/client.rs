//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - A local `DocumentEngine` that edits apply to immediately
//! - Presence updates with cursor rate limiting
//!
//! There is no separate offline queue. Edits made while disconnected stay in
//! the engine's ledger; on the next join the server's state vector tells the
//! client exactly which of them to push.
//!
//! Frames are queued on an unbounded channel while the engine lock is held,
//! so they leave in counter order and queueing never waits on the socket.
//! The backlog is at most the ledger tail the writer has not flushed yet.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use sketchsync_core::{
    ClientId, DocumentEngine, EngineError, Operation, PropValue, ShapeId, ShapeView,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::{CursorThrottle, Point, PresenceState, CURSOR_INTERVAL};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::room_id::RoomId;

/// Largest number of operations sent in one `Delta` frame.
pub const MAX_OPS_PER_DELTA: usize = 512;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Joined and caught up; edits go out immediately
    Connected,
    Reconnecting,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`. The room travels in the join
    /// message, not in the path.
    pub server_url: String,
    /// Buffered events before the reader task waits on the application
    pub event_buffer: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Give up after this many failed attempts in a row (None = never)
    pub max_reconnect_attempts: Option<u32>,
    pub cursor_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            event_buffer: 256,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            max_reconnect_attempts: None,
            cursor_interval: CURSOR_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            initial_backoff_ms: 20,
            max_backoff_ms: 200,
            max_reconnect_attempts: Some(50),
            cursor_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): exponential,
    /// capped, with up to 50% random jitter subtracted.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base - jitter)
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// WebSocket established, join sent
    Connected,
    /// Catch-up applied; `applied` operations were new
    Synced { applied: usize },
    /// Operations from a peer that changed the local replica
    RemoteOperations {
        peer_id: ClientId,
        ops: Vec<Operation>,
    },
    Presence {
        peer_id: ClientId,
        state: PresenceState,
    },
    PeerJoined(PeerInfo),
    PeerLeft(ClientId),
    /// The server refused a message and is closing the connection
    Rejected(String),
    Disconnected,
}

/// Client errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Engine(EngineError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<EngineError> for ClientError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

type Outgoing = Arc<RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

fn queue(tx: &mpsc::UnboundedSender<Vec<u8>>, frame: Vec<u8>) -> Result<(), ProtocolError> {
    tx.send(frame).map_err(|_| ProtocolError::ConnectionClosed)
}

/// Encode `ops` as one or more `Delta` frames and queue them.
fn queue_ops(
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    peer_id: ClientId,
    room_id: &RoomId,
    ops: &[Operation],
) -> Result<(), ProtocolError> {
    for chunk in ops.chunks(MAX_OPS_PER_DELTA) {
        queue(tx, SyncMessage::delta(peer_id, room_id, chunk)?.encode()?)?;
    }
    Ok(())
}

/// The sync client.
///
/// Share it behind an `Arc` to edit from one task while
/// [`run_with_reconnect`](Self::run_with_reconnect) runs in another.
pub struct SyncClient {
    peer_info: PeerInfo,
    room_id: RoomId,
    config: ClientConfig,
    engine: Arc<Mutex<DocumentEngine>>,
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: Outgoing,
    presence: Arc<Mutex<PresenceState>>,
    throttle: Mutex<CursorThrottle>,
    closing: AtomicBool,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room_id: RoomId, config: ClientConfig) -> Self {
        let engine = DocumentEngine::new(peer_info.peer_id);
        Self::with_engine(peer_info, room_id, config, engine)
    }

    /// Resume with an existing replica, e.g. one restored from a local
    /// snapshot. The engine must belong to `peer_info.peer_id`.
    pub fn with_engine(
        peer_info: PeerInfo,
        room_id: RoomId,
        config: ClientConfig,
        engine: DocumentEngine,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let presence = PresenceState::named(peer_info.name.clone());
        let throttle = CursorThrottle::new(config.cursor_interval);
        Self {
            peer_info,
            room_id,
            config,
            engine: Arc::new(Mutex::new(engine)),
            state: Arc::new(state),
            outgoing: Arc::new(RwLock::new(None)),
            presence: Arc::new(Mutex::new(presence)),
            throttle: Mutex::new(throttle),
            closing: AtomicBool::new(false),
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open a connection and join the room.
    ///
    /// Returns once the join is sent; `SyncEvent::Synced` follows when the
    /// catch-up arrives.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.closing.store(false, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connecting);

        let url = self.config.server_url.as_str();
        let ws_stream = match tokio_tungstenite::connect_async(url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {url} failed: {e}");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let vector = self.engine.lock().await.state_vector().clone();
        let join = SyncMessage::join(&self.peer_info, &self.room_id, &vector)?.encode()?;
        queue(&out_tx, join)?;
        *self.outgoing.write().await = Some(out_tx.clone());
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Joining room {} as {}", self.room_id, self.peer_info.peer_id);

        let reader = Reader {
            peer_id: self.peer_info.peer_id,
            room_id: self.room_id.clone(),
            engine: self.engine.clone(),
            state: self.state.clone(),
            outgoing: self.outgoing.clone(),
            presence: self.presence.clone(),
            out_tx,
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(reader.run(ws_reader));
        Ok(())
    }

    /// Keep the client connected until [`disconnect`](Self::disconnect) is
    /// called, reconnecting with exponential backoff.
    pub async fn run_with_reconnect(&self) -> Result<(), ProtocolError> {
        let mut failures = 0u32;
        loop {
            match self.connect().await {
                Ok(()) => {
                    failures = 0;
                    self.wait_disconnected().await;
                }
                Err(e) => {
                    failures += 1;
                    log::debug!("Reconnect attempt {failures} failed: {e}");
                    if self
                        .config
                        .max_reconnect_attempts
                        .is_some_and(|max| failures >= max)
                    {
                        return Err(e);
                    }
                }
            }
            if self.closing.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.state.send_replace(ConnectionState::Reconnecting);
            tokio::time::sleep(self.config.backoff_delay(failures.max(1))).await;
            if self.closing.load(Ordering::SeqCst) {
                self.state.send_replace(ConnectionState::Disconnected);
                return Ok(());
            }
        }
    }

    /// Resolves once the connection is down.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Resolves once joined and caught up.
    pub async fn wait_connected(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await;
    }

    /// Leave the room and close the connection. Stops `run_with_reconnect`.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(tx) = self.outgoing.write().await.take() {
            if let Ok(leave) = SyncMessage::leave(self.peer_info.peer_id, &self.room_id).encode() {
                let _ = queue(&tx, leave);
            }
        }
    }

    // ─── Editing ────────────────────────────────────────────────────

    /// Apply locally and send if connected.
    async fn commit<F>(&self, edit: F) -> Result<Operation, ClientError>
    where
        F: FnOnce(&mut DocumentEngine) -> Result<Operation, EngineError>,
    {
        let mut engine = self.engine.lock().await;
        let op = edit(&mut engine)?;
        // Queued under the engine lock so the catch-up push cannot miss it
        if *self.state.borrow() == ConnectionState::Connected {
            if let Some(tx) = self.outgoing.read().await.as_ref() {
                let sent = queue_ops(tx, self.peer_info.peer_id, &self.room_id, &[op.clone()]);
                if let Err(e) = sent {
                    log::debug!("Operation {} kept for resync: {e}", op.id);
                }
            }
        }
        Ok(op)
    }

    pub async fn create_shape(
        &self,
        props: BTreeMap<String, PropValue>,
    ) -> Result<ShapeId, ClientError> {
        let op = self.commit(|engine| engine.create_shape(props)).await?;
        Ok(op.shape())
    }

    pub async fn set_property(
        &self,
        shape: ShapeId,
        key: impl Into<String>,
        value: impl Into<PropValue>,
    ) -> Result<(), ClientError> {
        let (key, value) = (key.into(), value.into());
        self.commit(|engine| engine.set_property(shape, key, value))
            .await?;
        Ok(())
    }

    pub async fn delete_shape(&self, shape: ShapeId) -> Result<(), ClientError> {
        self.commit(|engine| engine.delete_shape(shape)).await?;
        Ok(())
    }

    pub async fn shape(&self, id: ShapeId) -> Option<ShapeView> {
        self.engine.lock().await.shape(id)
    }

    pub async fn shapes(&self) -> Vec<ShapeView> {
        self.engine.lock().await.shapes()
    }

    /// The local replica.
    pub fn engine(&self) -> &Arc<Mutex<DocumentEngine>> {
        &self.engine
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Replace the whole presence state and send it. Offline updates are
    /// kept locally and sent after the next join.
    pub async fn update_presence(&self, state: PresenceState) -> Result<(), ProtocolError> {
        *self.presence.lock().await = state;
        self.throttle.lock().await.mark_sent();
        self.send_presence().await
    }

    /// Move the cursor. Rate limited; skipped updates are not resent.
    pub async fn move_cursor(&self, at: Point) -> Result<(), ProtocolError> {
        self.presence.lock().await.cursor = Some(at);
        if !self.throttle.lock().await.should_send() {
            return Ok(());
        }
        self.send_presence().await
    }

    pub async fn select(&self, selection: Vec<ShapeId>) -> Result<(), ProtocolError> {
        self.presence.lock().await.selection = selection;
        self.send_presence().await
    }

    async fn send_presence(&self) -> Result<(), ProtocolError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Ok(());
        }
        let state = self.presence.lock().await.clone();
        let encoded =
            SyncMessage::presence(self.peer_info.peer_id, &self.room_id, &state)?.encode()?;
        if let Some(tx) = self.outgoing.read().await.as_ref() {
            queue(tx, encoded)?;
        }
        Ok(())
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id, &self.room_id).encode()?;
        match self.outgoing.read().await.as_ref() {
            Some(tx) => queue(tx, encoded),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Re-run the state vector exchange without reconnecting.
    ///
    /// Sends `SyncStep1` with the local vector; the server answers with the
    /// operations this replica lacks, which arrive as `SyncEvent::Synced`.
    /// Anything the server lacks in turn is pushed back the same way as
    /// after a join.
    pub async fn resync(&self) -> Result<(), ProtocolError> {
        let engine = self.engine.lock().await;
        let request =
            SyncMessage::sync_step1(self.peer_info.peer_id, &self.room_id, engine.state_vector())?
                .encode()?;
        drop(engine);
        match self.outgoing.read().await.as_ref() {
            Some(tx) => queue(tx, request),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Reader task state for one connection.
struct Reader {
    peer_id: ClientId,
    room_id: RoomId,
    engine: Arc<Mutex<DocumentEngine>>,
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: Outgoing,
    presence: Arc<Mutex<PresenceState>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Reader {
    async fn run<S>(self, mut ws_reader: S)
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match SyncMessage::decode(&bytes) {
                        Ok(sync_msg) => self.handle(sync_msg).await,
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    }
                }
                Ok(Message::Close(frame)) => {
                    log::info!("Server closed connection: {frame:?}");
                    break;
                }
                Err(e) => {
                    log::warn!("Connection error: {e}");
                    break;
                }
                _ => {}
            }
        }

        // Connection lost
        let mut outgoing = self.outgoing.write().await;
        if outgoing
            .as_ref()
            .is_some_and(|tx| tx.same_channel(&self.out_tx))
        {
            *outgoing = None;
        }
        drop(outgoing);
        self.state.send_replace(ConnectionState::Disconnected);
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
    }

    async fn handle(&self, msg: SyncMessage) {
        if msg.room_id != self.room_id {
            log::warn!("Ignoring message for room {}", msg.room_id);
            return;
        }
        let event = match msg.msg_type {
            MessageType::SyncStep2 => self.apply_catch_up(&msg).await,
            MessageType::Delta => match msg.operations() {
                Ok(ops) => {
                    let applied = self.engine.lock().await.apply_all(ops.clone());
                    match applied {
                        Ok(stats) if stats.new_ops() > 0 => Some(SyncEvent::RemoteOperations {
                            peer_id: msg.peer_id,
                            ops,
                        }),
                        Ok(_) => None,
                        Err(e) => {
                            log::warn!("Rejected delta from {}: {e}", msg.peer_id);
                            None
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Invalid delta from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::Presence => msg.presence_state().ok().map(|state| SyncEvent::Presence {
                peer_id: msg.peer_id,
                state,
            }),
            MessageType::PeerJoined => msg.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::Leave => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Error => {
                let reason = msg.error_reason().unwrap_or_default();
                log::warn!("Server rejected a message: {reason}");
                Some(SyncEvent::Rejected(reason))
            }
            MessageType::Ping => {
                if let Ok(pong) = SyncMessage::pong(self.peer_id, &self.room_id).encode() {
                    let _ = queue(&self.out_tx, pong);
                }
                None
            }
            MessageType::Pong => None,
            other => {
                log::debug!("Unhandled message type: {other:?}");
                None
            }
        };

        if let Some(evt) = event {
            let _ = self.event_tx.send(evt).await;
        }
    }

    /// Apply the server's catch-up, then push whatever the server lacks.
    async fn apply_catch_up(&self, msg: &SyncMessage) -> Option<SyncEvent> {
        let catch_up = match msg.catch_up() {
            Ok(catch_up) => catch_up,
            Err(e) => {
                log::warn!("Invalid catch-up: {e}");
                return None;
            }
        };

        let mut engine = self.engine.lock().await;
        let applied = match engine.apply_all(catch_up.ops) {
            Ok(stats) => stats.new_ops(),
            Err(e) => {
                log::warn!("Rejected catch-up: {e}");
                return None;
            }
        };
        let missing = engine.diff(&catch_up.vector);
        if !missing.is_empty() {
            log::info!("Pushing {} operations the server lacks", missing.len());
            if let Err(e) = queue_ops(&self.out_tx, self.peer_id, &self.room_id, missing.ops()) {
                log::warn!("Failed to push offline edits: {e}");
            }
        }
        self.state.send_replace(ConnectionState::Connected);
        drop(engine);

        let state = self.presence.lock().await.clone();
        match SyncMessage::presence(self.peer_id, &self.room_id, &state).and_then(|m| m.encode()) {
            Ok(encoded) => {
                let _ = queue(&self.out_tx, encoded);
            }
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }

        Some(SyncEvent::Synced { applied })
    }
}
