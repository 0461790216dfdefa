//! WebSocket sync server with room-based scene routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/scene/<id>
//!             ├── RoomManager ── SceneRoom (id) ──┬── SceneStore ── Debouncer ── SceneStorage
//! Client B ──┘                                    │                                 │
//!                                                 │                     ┌───────────┴─────────┐
//!                                                 │                     ▼                     ▼
//!                                                 │               SceneDb (RocksDB)     MemoryStorage
//!                                                 │
//!                          ┌──────────────────────┼──────────────────────┐
//!                          ▼                      ▼                      ▼
//!                       Client A              Client B               Client C
//! ```
//!
//! One connection is one client. The URL path names the scene; the first
//! `join` message enters the room, after which the connection forwards
//! the session stream while routing the client's edits into the room.
//! Conflicts and storage failures are answered to the sender only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, Reply, ServerMessage};
use crate::room::{RoomConfig, RoomManager, Session};
use crate::scene::{PatchOutcome, SceneError};
use crate::storage::{MemoryStorage, SceneDb, SceneStorage, StoreConfig, StoreError};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Max elements per initial-sync message (`None` = unbatched)
    pub snapshot_batch_size: Option<usize>,
    /// Minimum milliseconds between two storage writes of one scene
    pub persist_interval_ms: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            snapshot_batch_size: Some(256),
            persist_interval_ms: 1_000,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    fn room_config(&self) -> RoomConfig {
        RoomConfig {
            snapshot_batch_size: self.snapshot_batch_size,
            persist_interval: Duration::from_millis(self.persist_interval_ms),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    /// Structural patches rejected as conflicts
    pub conflicts: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let storage: Arc<dyn SceneStorage> = match &config.storage_path {
            Some(path) => Arc::new(SceneDb::open(StoreConfig::new(path.clone()))?),
            None => Arc::new(MemoryStorage::new()),
        };
        Ok(Self::with_backend(config, storage))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Create on top of an already opened storage backend.
    pub fn with_backend(config: ServerConfig, storage: Arc<dyn SceneStorage>) -> Self {
        let rooms = Arc::new(RoomManager::new(storage, config.room_config()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Write every pending scene to storage.
    pub async fn shutdown(&self) -> Result<(), SceneError> {
        log::info!("Flushing {} open rooms", self.rooms.room_count().await);
        self.rooms.flush_all().await
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> ConnectionResult {
        let mut scene_id = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                match scene_id_from_path(request.uri().path()) {
                    Some(id) => {
                        scene_id = Some(id);
                        Ok(response)
                    }
                    None => {
                        let mut error = ErrorResponse::new(Some("expected /scene/<id>".into()));
                        *error.status_mut() = StatusCode::NOT_FOUND;
                        Err(error)
                    }
                }
            },
        )
        .await?;
        let Some(scene_id) = scene_id else {
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr} for scene {scene_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            let room = rooms.get_or_create(&scene_id).await?;
            {
                let mut s = stats.write().await;
                s.active_rooms = rooms.room_count().await;
            }

            let mut session: Option<Session> = None;

            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.write().await.total_messages += 1;

                                let reply = match ClientMessage::decode(&text) {
                                    Ok(ClientMessage::Join(collaborator)) => {
                                        if session.is_some() {
                                            log::debug!("Duplicate join from {addr} ignored");
                                        } else {
                                            session = Some(room.join(collaborator).await);
                                        }
                                        None
                                    }
                                    Ok(ClientMessage::Update(mut collaborator)) => {
                                        match &session {
                                            Some(s) => {
                                                collaborator.id = s.id().to_string();
                                                room.update(collaborator);
                                            }
                                            None => log::debug!("Update before join from {addr} ignored"),
                                        }
                                        None
                                    }
                                    Ok(ClientMessage::Patch(ops)) => {
                                        log::debug!("{} patch ops from {addr} on scene {scene_id}", ops.len());
                                        outcome_reply(room.patch_ops(ops).await, &stats).await
                                    }
                                    Ok(ClientMessage::PatchElements(patches)) => {
                                        log::debug!("{} element patches from {addr} on scene {scene_id}", patches.len());
                                        outcome_reply(room.patch_elements(patches).await, &stats).await
                                    }
                                    Ok(ClientMessage::Ping) => Some(Reply::Pong),
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        Some(Reply::Error(e.to_string()))
                                    }
                                };

                                if let Some(reply) = reply {
                                    let encoded = ServerMessage::from(reply).encode()?;
                                    ws_sender.send(Message::Text(encoded.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing session event
                    msg = async {
                        match session.as_mut() {
                            Some(s) => s.next().await,
                            // Not joined yet, wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(msg) = msg else { break };
                        ws_sender.send(Message::Text(msg.encode()?.into())).await?;
                    }
                }
            }

            // Leaving the room before the manager looks at it.
            drop(session);
            drop(room);
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        match rooms.remove_if_empty(&scene_id).await {
            Ok(_) => {}
            Err(e) => log::error!("Failed to persist scene {scene_id} on close: {e}"),
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get room manager reference.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// The reply owed to the sender of a patch, if any.
async fn outcome_reply(
    outcome: Result<PatchOutcome, SceneError>,
    stats: &RwLock<ServerStats>,
) -> Option<Reply> {
    match outcome {
        Ok(PatchOutcome { conflict: false, .. }) => None,
        Ok(PatchOutcome { conflict: true, scene }) => {
            stats.write().await.conflicts += 1;
            Some(Reply::Conflict {
                elements: scene.elements,
                version: scene.version,
            })
        }
        Err(e) => {
            log::error!("Patch applied but not persisted: {e}");
            Some(Reply::Error(e.to_string()))
        }
    }
}

/// Scene id from a request path: `/scene/<id>` or `/<id>`.
fn scene_id_from_path(path: &str) -> Option<String> {
    let rest = path
        .strip_prefix("/scene/")
        .or_else(|| path.strip_prefix('/'))?;
    let id = rest.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.snapshot_batch_size, Some(256));
        assert_eq!(config.persist_interval_ms, 1_000);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_room_config_from_server_config() {
        let config = ServerConfig {
            snapshot_batch_size: None,
            persist_interval_ms: 250,
            ..ServerConfig::default()
        };
        let room = config.room_config();
        assert_eq!(room.snapshot_batch_size, None);
        assert_eq!(room.persist_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert!(dir.path().join("db").exists());
        assert_eq!(server.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_rooms() {
        let storage = Arc::new(MemoryStorage::new());
        let config = ServerConfig {
            persist_interval_ms: 3_600_000,
            ..ServerConfig::default()
        };
        let server = SyncServer::with_backend(config, storage.clone());

        let room = server.rooms().get_or_create("s").await.unwrap();
        room.patch_elements(Default::default()).await.unwrap();
        room.patch_elements(Default::default()).await.unwrap();
        assert_eq!(storage.get("s").unwrap().version, 1);

        server.shutdown().await.unwrap();
        assert_eq!(storage.get("s").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_outcome_reply() {
        let stats = RwLock::new(ServerStats::default());

        let applied = PatchOutcome {
            conflict: false,
            scene: Default::default(),
        };
        assert_eq!(outcome_reply(Ok(applied), &stats).await, None);

        let rejected = PatchOutcome {
            conflict: true,
            scene: Default::default(),
        };
        assert_eq!(
            outcome_reply(Ok(rejected), &stats).await,
            Some(Reply::Conflict {
                elements: Default::default(),
                version: 0
            })
        );
        assert_eq!(stats.read().await.conflicts, 1);

        let failed = Err(SceneError::Storage(StoreError::Unavailable("down".into())));
        assert!(matches!(outcome_reply(failed, &stats).await, Some(Reply::Error(_))));
    }

    #[test]
    fn test_scene_id_from_path() {
        assert_eq!(scene_id_from_path("/scene/abc"), Some("abc".to_string()));
        assert_eq!(scene_id_from_path("/scene/abc/"), Some("abc".to_string()));
        assert_eq!(scene_id_from_path("/abc"), Some("abc".to_string()));
        assert_eq!(scene_id_from_path("/"), None);
        assert_eq!(scene_id_from_path("/scene/"), None);
        assert_eq!(scene_id_from_path("/a/b"), None);
    }
}
