//! Authoritative scene state and its two merge strategies.
//!
//! ```text
//!                   ┌─────────────────────────────┐
//! patch_ops ───────►│ Change::Structural          │── conflict ──► unchanged scene
//!                   │   JSON patch on             │
//!                   │   {"elements", "version"}   │
//! patch_elements ──►│ Change::Fields              │
//!                   │   per-element LWW on        │
//!                   │   `updated`                 │
//!                   └──────────────┬──────────────┘
//!                                  ▼
//!                      version += 1 ─► persist (debounced) ─► notify
//! ```
//!
//! All entry points take the same per-scene lock, so two merges never
//! interleave their read-modify-write and events leave in version order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastChannel, Subscription};
use crate::debounce::Debouncer;
use crate::patch::{self, PatchError, PatchOperation};
use crate::protocol::{Element, ElementId, ElementPatch, Scene, SceneEvent};
use crate::storage::{SceneStorage, StoreError};

/// One mutation request against a scene.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Ordered JSON patch over the whole scene document
    Structural(Vec<PatchOperation>),
    /// Last-writer-wins replacement or removal per element
    Fields(BTreeMap<ElementId, ElementPatch>),
}

/// Result of a merge call.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    /// Set when a structural merge was rejected; `scene` is then unchanged
    pub conflict: bool,
    pub scene: Scene,
}

/// What an accepted change did to the element map.
enum Effect {
    /// The whole map was replaced
    Replaced,
    /// Only these entries changed
    Diff(BTreeMap<ElementId, ElementPatch>),
}

/// Why a structural merge was rejected.
#[derive(Debug)]
enum Conflict {
    Patch(PatchError),
    InvalidElements(String),
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conflict::Patch(e) => write!(f, "{e}"),
            Conflict::InvalidElements(e) => write!(f, "patched elements are invalid: {e}"),
        }
    }
}

impl Change {
    fn merge(self, scene: &mut Scene) -> Result<Effect, Conflict> {
        match self {
            Change::Structural(ops) => merge_structural(scene, &ops).map(|()| Effect::Replaced),
            Change::Fields(patches) => Ok(Effect::Diff(merge_fields(&mut scene.elements, patches))),
        }
    }
}

/// Apply `ops` to `{"elements": .., "version": ..}` and adopt the resulting
/// element map. The version in the document is only there to be tested.
fn merge_structural(scene: &mut Scene, ops: &[PatchOperation]) -> Result<(), Conflict> {
    let elements = serde_json::to_value(&scene.elements)
        .map_err(|e| Conflict::InvalidElements(e.to_string()))?;
    let mut doc = json!({ "elements": elements, "version": scene.version });

    patch::apply(&mut doc, ops).map_err(Conflict::Patch)?;

    let patched = doc.get_mut("elements").map(Value::take).unwrap_or(Value::Null);
    let elements = serde_json::from_value::<BTreeMap<ElementId, Element>>(patched)
        .map_err(|e| Conflict::InvalidElements(e.to_string()))?;
    if let Some((key, element)) = elements.iter().find(|(key, element)| **key != element.id) {
        return Err(Conflict::InvalidElements(format!(
            "entry {key} holds element {}",
            element.id
        )));
    }
    scene.elements = elements;
    Ok(())
}

/// Per-element last-writer-wins. Returns the accepted or removed entries;
/// stale replacements are left out, as are replacements whose `id` does not
/// match the key they were sent under.
fn merge_fields(
    elements: &mut BTreeMap<ElementId, Element>,
    patches: BTreeMap<ElementId, ElementPatch>,
) -> BTreeMap<ElementId, ElementPatch> {
    let mut diff = BTreeMap::new();
    for (id, patch) in patches {
        match patch {
            ElementPatch::Tombstone => {
                elements.remove(&id);
                diff.insert(id, ElementPatch::Tombstone);
            }
            ElementPatch::Replace(element) if element.id != id => {
                log::debug!("Discarding element {} sent under key {id}", element.id);
            }
            ElementPatch::Replace(element) => {
                let newer = elements
                    .get(&id)
                    .map_or(true, |current| element.updated > current.updated);
                if newer {
                    elements.insert(id.clone(), element.clone());
                    diff.insert(id, ElementPatch::Replace(element));
                } else {
                    log::trace!("Discarding stale element {id} (updated {})", element.updated);
                }
            }
        }
    }
    diff
}

/// Scene store errors.
#[derive(Debug, Clone)]
pub enum SceneError {
    /// Loading or persisting the scene failed
    Storage(StoreError),
}

impl std::fmt::Display for SceneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneError::Storage(e) => write!(f, "Scene storage failure: {e}"),
        }
    }
}

impl std::error::Error for SceneError {}

impl From<StoreError> for SceneError {
    fn from(e: StoreError) -> Self {
        SceneError::Storage(e)
    }
}

/// The versioned element set of one scene.
pub struct SceneStore {
    scene_id: String,
    state: Mutex<Scene>,
    events: BroadcastChannel<SceneEvent>,
    persistence: Debouncer<Scene>,
}

impl SceneStore {
    /// Load `scene_id` from `storage` (empty scene at version 0 if absent)
    /// and persist it back through a debouncer with `persist_interval`.
    pub fn open(
        scene_id: impl Into<String>,
        storage: Arc<dyn SceneStorage>,
        persist_interval: Duration,
    ) -> Result<Self, SceneError> {
        let scene_id = scene_id.into();
        let scene = storage.load(&scene_id)?.unwrap_or_default();
        log::info!(
            "Loaded scene {scene_id} at v{} ({} elements)",
            scene.version,
            scene.elements.len()
        );

        let target = scene_id.clone();
        let persistence = Debouncer::new(persist_interval, move |scene: &Scene| {
            storage.save(&target, scene)
        });

        Ok(Self {
            scene_id,
            state: Mutex::new(scene),
            events: BroadcastChannel::new(),
            persistence,
        })
    }

    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    /// Structural merge.
    pub async fn patch_ops(&self, ops: Vec<PatchOperation>) -> Result<PatchOutcome, SceneError> {
        self.apply(Change::Structural(ops)).await
    }

    /// Field-level merge.
    pub async fn patch_elements(
        &self,
        patches: BTreeMap<ElementId, ElementPatch>,
    ) -> Result<PatchOutcome, SceneError> {
        self.apply(Change::Fields(patches)).await
    }

    /// Apply a change under the scene lock.
    ///
    /// A structural conflict returns the current scene with `conflict` set
    /// and leaves version, storage and subscribers untouched. Otherwise the
    /// version advances by exactly one, the event goes out, and a storage
    /// failure is returned as an error after the in-memory state moved on.
    pub async fn apply(&self, change: Change) -> Result<PatchOutcome, SceneError> {
        let mut scene = self.state.lock().await;

        let effect = match change.merge(&mut scene) {
            Ok(effect) => effect,
            Err(conflict) => {
                log::warn!("Conflict on scene {} at v{}: {conflict}", self.scene_id, scene.version);
                return Ok(PatchOutcome {
                    conflict: true,
                    scene: scene.clone(),
                });
            }
        };

        scene.version += 1;
        let version = scene.version;
        let event = match effect {
            Effect::Replaced => SceneEvent::SceneElementsSynced {
                elements: scene.elements.clone(),
                version,
            },
            Effect::Diff(diff) => SceneEvent::SceneElementsDiff { diff, version },
        };

        let persisted = self.persistence.submit(scene.clone());
        let delivered = self.events.notify(event);
        log::debug!("Scene {} now at v{version}, notified {delivered} subscribers", self.scene_id);

        if let Err(e) = persisted {
            log::error!("Failed to persist scene {} at v{version}: {e}", self.scene_id);
            return Err(e.into());
        }

        Ok(PatchOutcome {
            conflict: false,
            scene: scene.clone(),
        })
    }

    /// Consistent copy of the current scene.
    pub async fn snapshot(&self) -> Scene {
        self.state.lock().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    /// Subscribe to scene events from now on.
    pub fn subscribe(&self) -> Subscription<SceneEvent> {
        self.events.subscribe()
    }

    /// Snapshot and subscribe atomically: every event after the returned
    /// scene's version is delivered, none before it.
    pub async fn snapshot_and_subscribe(&self) -> (Scene, Subscription<SceneEvent>) {
        let scene = self.state.lock().await;
        let subscription = self.events.subscribe();
        (scene.clone(), subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Write any pending debounced save now.
    pub async fn flush(&self) -> Result<(), SceneError> {
        let _scene = self.state.lock().await;
        self.persistence.flush()?;
        Ok(())
    }

    /// Number of writes that reached storage.
    pub fn persisted_writes(&self) -> u64 {
        self.persistence.writes()
    }
}
