//! Collaboration rooms: roster, join/leave lifecycle and per-client streams.
//!
//! ```text
//!            join()                         drop(Session)
//! Joining ─────────────► Active ──────────────────────────► Left
//!   │ assign id             │ update() ─► collaborator-updated
//!   │ register in roster    │ patch*() ─► scene events
//!   │ subscribe channels    │
//!   │ scene-synced (+diffs) │
//! ```
//!
//! A client's stream is the initial snapshot followed by the live merge of
//! the roster channel and the scene channel. Dropping the stream runs the
//! leave cleanup exactly once: the collaborator is removed from the roster
//! and `collaborator-left` goes to everyone still in the room.
//!
//! Each `SceneRoom` is the single writer for its scene; `RoomManager` maps
//! scene ids to rooms the way a host runtime maps ids to actor instances.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::BroadcastChannel;
use crate::multiplex::multiplex;
use crate::patch::PatchOperation;
use crate::protocol::{
    CollaborationEvent, Collaborator, Element, ElementId, ElementPatch, Scene, SceneEvent,
    ServerMessage,
};
use crate::scene::{PatchOutcome, SceneError, SceneStore};
use crate::storage::SceneStorage;

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Max elements per initial-sync message (`None` = one message)
    pub snapshot_batch_size: Option<usize>,
    /// Minimum time between two storage writes of the scene
    pub persist_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            snapshot_batch_size: Some(256),
            persist_interval: Duration::from_secs(1),
        }
    }
}

/// Roster entry. `session` tells apart two connections reusing one id.
struct Member {
    collaborator: Collaborator,
    session: u64,
}

type Roster = Arc<Mutex<BTreeMap<String, Member>>>;

/// One scene plus everybody editing it.
pub struct SceneRoom {
    store: SceneStore,
    roster: Roster,
    presence: BroadcastChannel<CollaborationEvent>,
    next_session: AtomicU64,
    config: RoomConfig,
}

impl SceneRoom {
    /// Open the room for `scene_id`, loading the scene from `storage`.
    pub fn open(
        scene_id: impl Into<String>,
        storage: Arc<dyn SceneStorage>,
        config: RoomConfig,
    ) -> Result<Self, SceneError> {
        let store = SceneStore::open(scene_id, storage, config.persist_interval)?;
        Ok(Self {
            store,
            roster: Arc::new(Mutex::new(BTreeMap::new())),
            presence: BroadcastChannel::new(),
            next_session: AtomicU64::new(0),
            config,
        })
    }

    pub fn scene_id(&self) -> &str {
        self.store.scene_id()
    }

    /// Join the room.
    ///
    /// Assigns an id when `collaborator.id` is empty, announces the
    /// collaborator to the others and returns the client's stream: the
    /// snapshot first, then live events. Dropping the returned [`Session`]
    /// leaves the room.
    pub async fn join(&self, mut collaborator: Collaborator) -> Session {
        if collaborator.id.is_empty() {
            collaborator.id = Uuid::new_v4().to_string();
        }
        let id = collaborator.id.clone();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        let presence = {
            let roster = Arc::clone(&self.roster);
            let channel = self.presence.clone();
            let leaving = id.clone();
            let scene_id = self.scene_id().to_string();
            self.presence.subscribe_with_cleanup(move || {
                let mut roster = roster.lock();
                let ours = roster.get(&leaving).is_some_and(|m| m.session == session);
                if ours {
                    roster.remove(&leaving);
                    channel.notify(CollaborationEvent::CollaboratorLeft(leaving.clone()));
                    log::info!("Collaborator {leaving} left scene {scene_id}");
                }
            })
        };

        {
            let mut roster = self.roster.lock();
            roster.insert(
                id.clone(),
                Member {
                    collaborator: collaborator.clone(),
                    session,
                },
            );
            self.presence
                .notify(CollaborationEvent::CollaboratorUpdated(collaborator.clone()));
        }

        let (scene, scene_events) = self.store.snapshot_and_subscribe().await;
        let collaborators = self.collaborators();
        log::info!(
            "Collaborator {id} joined scene {} at v{} ({} present)",
            self.scene_id(),
            scene.version,
            collaborators.len()
        );

        let initial = initial_sync(scene, collaborators, self.config.snapshot_batch_size);

        let own_id = id.clone();
        let roster_stream = presence
            .filter_map(move |event| {
                let echo = matches!(&event, CollaborationEvent::CollaboratorUpdated(c) if c.id == own_id);
                futures_util::future::ready((!echo).then(|| ServerMessage::from(event)))
            })
            .boxed();
        let scene_stream = scene_events.map(ServerMessage::from).boxed();

        let stream = stream::iter(initial)
            .chain(multiplex(vec![roster_stream, scene_stream]))
            .boxed();

        Session { id, stream }
    }

    /// Update an active collaborator's presence.
    ///
    /// Fields left `None` keep their previous value. Returns `false` and
    /// does nothing when `collaborator.id` is not in the room.
    pub fn update(&self, collaborator: Collaborator) -> bool {
        let mut roster = self.roster.lock();
        let Some(member) = roster.get_mut(&collaborator.id) else {
            log::debug!(
                "Ignoring update for unknown collaborator {} in scene {}",
                collaborator.id,
                self.scene_id()
            );
            return false;
        };
        let merged = collaborator.merged_over(&member.collaborator);
        member.collaborator = merged.clone();
        self.presence.notify(CollaborationEvent::CollaboratorUpdated(merged));
        true
    }

    /// Structural merge. See [`SceneStore::apply`].
    pub async fn patch_ops(&self, ops: Vec<PatchOperation>) -> Result<PatchOutcome, SceneError> {
        self.store.patch_ops(ops).await
    }

    /// Field-level merge. See [`SceneStore::apply`].
    pub async fn patch_elements(
        &self,
        patches: BTreeMap<ElementId, ElementPatch>,
    ) -> Result<PatchOutcome, SceneError> {
        self.store.patch_elements(patches).await
    }

    pub async fn scene(&self) -> Scene {
        self.store.snapshot().await
    }

    /// Current roster by collaborator id.
    pub fn collaborators(&self) -> BTreeMap<String, Collaborator> {
        self.roster
            .lock()
            .iter()
            .map(|(id, member)| (id.clone(), member.collaborator.clone()))
            .collect()
    }

    pub fn collaborator_count(&self) -> usize {
        self.roster.lock().len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.roster.lock().contains_key(id)
    }

    /// Write the scene to storage if a debounced save is pending.
    pub async fn flush(&self) -> Result<(), SceneError> {
        self.store.flush().await
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }
}

/// Build the join-time messages: one `scene-synced` carrying the roster and
/// the first batch of elements, then `scene-elements-diff` batches, all at
/// the snapshot's version.
fn initial_sync(
    scene: Scene,
    collaborators: BTreeMap<String, Collaborator>,
    batch_size: Option<usize>,
) -> Vec<ServerMessage> {
    let version = scene.version;
    let batch_size = batch_size.filter(|&n| n > 0).unwrap_or(usize::MAX);

    let mut elements = scene.elements.into_iter();
    let first: BTreeMap<ElementId, Element> = elements.by_ref().take(batch_size).collect();
    let mut messages = vec![ServerMessage::from(SceneEvent::SceneSynced {
        elements: first,
        collaborators,
        version,
    })];

    loop {
        let diff: BTreeMap<ElementId, ElementPatch> = elements
            .by_ref()
            .take(batch_size)
            .map(|(id, element)| (id, ElementPatch::Replace(element)))
            .collect();
        if diff.is_empty() {
            break;
        }
        messages.push(SceneEvent::SceneElementsDiff { diff, version }.into());
    }
    messages
}

/// A joined client's view of the room.
///
/// Yields the initial sync messages, then live events in arrival order.
/// Dropping it (or calling [`Session::leave`]) leaves the room.
pub struct Session {
    id: String,
    stream: BoxStream<'static, ServerMessage>,
}

impl Session {
    /// The collaborator id this session joined with.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn leave(self) {}
}

impl Stream for Session {
    type Item = ServerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ServerMessage>> {
        self.stream.poll_next_unpin(cx)
    }
}

/// Room manager: maps scene ids to live rooms.
///
/// The first request for a scene loads it from storage; afterwards every
/// caller shares the same `SceneRoom`, which serializes all writes.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<SceneRoom>>>,
    storage: Arc<dyn SceneStorage>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(storage: Arc<dyn SceneStorage>, config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            storage,
            config,
        }
    }

    /// Get or open the room for `scene_id`.
    pub async fn get_or_create(&self, scene_id: &str) -> Result<Arc<SceneRoom>, SceneError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(scene_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(scene_id) {
            return Ok(room.clone());
        }

        let room = Arc::new(SceneRoom::open(
            scene_id,
            Arc::clone(&self.storage),
            self.config.clone(),
        )?);
        rooms.insert(scene_id.to_string(), room.clone());
        log::info!("Room {scene_id} opened");
        Ok(room)
    }

    /// Flush and drop the room if nobody is in it.
    ///
    /// A room still referenced outside the manager (a connection that has
    /// not joined yet, say) is kept so the scene never gets two writers.
    pub async fn remove_if_empty(&self, scene_id: &str) -> Result<bool, SceneError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(scene_id) else {
            return Ok(false);
        };
        if room.collaborator_count() > 0 || Arc::strong_count(room) > 1 {
            return Ok(false);
        }
        room.flush().await?;
        rooms.remove(scene_id);
        log::info!("Room {scene_id} removed (empty)");
        Ok(true)
    }

    /// Flush every open room, reporting the first failure.
    pub async fn flush_all(&self) -> Result<(), SceneError> {
        let rooms: Vec<Arc<SceneRoom>> = self.rooms.read().await.values().cloned().collect();
        let mut first_error = None;
        for room in rooms {
            if let Err(e) = room.flush().await {
                log::error!("Failed to flush scene {}: {e}", room.scene_id());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_scenes(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn storage(&self) -> &Arc<dyn SceneStorage> {
        &self.storage
    }
}
