//! JSON wire protocol for scene synchronization.
//!
//! Every message is an adjacently tagged object:
//! ```text
//! ┌────────────────────────────┬──────────────────────────────────────┐
//! │ type                       │ payload                              │
//! ├────────────────────────────┼──────────────────────────────────────┤
//! │ scene-synced               │ { elements, collaborators, version } │
//! │ scene-elements-synced      │ { elements, version }                │
//! │ scene-elements-diff        │ { diff, version }                    │
//! │ collaborator-updated       │ Collaborator                         │
//! │ collaborator-left          │ "<collaborator id>"                  │
//! └────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Elements are opaque records: only `id` and `updated` are interpreted,
//! every other field is carried through untouched.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::patch::PatchOperation;

/// Element identity.
pub type ElementId = String;

/// One drawable record of the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    /// Last-update timestamp used for last-writer-wins merging.
    ///
    /// Integer milliseconds on the wire; `null` or absent reads as 0 and
    /// integral floats (`5.0`) are accepted. Fractional values are rejected.
    #[serde(default, deserialize_with = "timestamp")]
    pub updated: i64,
    /// Everything else the client stored on the element
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Element {
    pub fn new(id: impl Into<ElementId>, updated: i64) -> Self {
        Self {
            id: id.into(),
            updated,
            fields: Map::new(),
        }
    }

    /// Builder-style helper for attaching an opaque field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let invalid = |found: &dyn std::fmt::Display| {
        D::Error::custom(format!("`updated` must be an integer timestamp, got {found}"))
    };
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| invalid(&n)),
        Some(other) => Err(invalid(&other)),
    }
}

/// Per-element entry of a field-level patch.
///
/// On the wire a tombstone is `{"deleted": true}`; anything else is a full
/// replacement element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementPatch {
    Tombstone,
    Replace(Element),
}

impl ElementPatch {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, ElementPatch::Tombstone)
    }
}

impl From<Element> for ElementPatch {
    fn from(element: Element) -> Self {
        ElementPatch::Replace(element)
    }
}

impl Serialize for ElementPatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ElementPatch::Tombstone => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("deleted", &true)?;
                map.end()
            }
            ElementPatch::Replace(element) => element.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ElementPatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.get("deleted") == Some(&Value::Bool(true)) {
            return Ok(ElementPatch::Tombstone);
        }
        serde_json::from_value(value)
            .map(ElementPatch::Replace)
            .map_err(D::Error::custom)
    }
}

/// The shared, versioned document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub elements: BTreeMap<ElementId, Element>,
    #[serde(default)]
    pub version: u64,
}

/// A participant's presence record. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    /// Server-assigned when empty
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Collaborator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Collaborator without an id; the room assigns one on join.
    pub fn anonymous(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    /// Fill every field missing from `self` with the value in `previous`.
    ///
    /// Presence updates usually carry only what changed (a pointer move
    /// does not resend the avatar).
    pub fn merged_over(mut self, previous: &Collaborator) -> Self {
        fn keep<T: Clone>(field: &mut Option<T>, previous: &Option<T>) {
            if field.is_none() {
                *field = previous.clone();
            }
        }
        keep(&mut self.pointer, &previous.pointer);
        keep(&mut self.selection, &previous.selection);
        keep(&mut self.username, &previous.username);
        keep(&mut self.user_state, &previous.user_state);
        keep(&mut self.color, &previous.color);
        keep(&mut self.avatar_url, &previous.avatar_url);
        self
    }
}

/// Roster events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum CollaborationEvent {
    CollaboratorUpdated(Collaborator),
    CollaboratorLeft(String),
}

/// Scene events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SceneEvent {
    /// Initial snapshot, sent once per join
    SceneSynced {
        elements: BTreeMap<ElementId, Element>,
        collaborators: BTreeMap<String, Collaborator>,
        version: u64,
    },
    /// Full element map after a structural merge
    SceneElementsSynced {
        elements: BTreeMap<ElementId, Element>,
        version: u64,
    },
    /// Only the elements touched by a field-level merge
    SceneElementsDiff {
        diff: BTreeMap<ElementId, ElementPatch>,
        version: u64,
    },
}

impl SceneEvent {
    pub fn version(&self) -> u64 {
        match self {
            SceneEvent::SceneSynced { version, .. }
            | SceneEvent::SceneElementsSynced { version, .. }
            | SceneEvent::SceneElementsDiff { version, .. } => *version,
        }
    }
}

/// Transport-level replies addressed to a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Reply {
    /// A structural patch was rejected; carries the unchanged current state
    Conflict {
        elements: BTreeMap<ElementId, Element>,
        version: u64,
    },
    Error(String),
    Pong,
}

/// Everything the server sends down a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Collaboration(CollaborationEvent),
    Scene(SceneEvent),
    Reply(Reply),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl From<CollaborationEvent> for ServerMessage {
    fn from(event: CollaborationEvent) -> Self {
        ServerMessage::Collaboration(event)
    }
}

impl From<SceneEvent> for ServerMessage {
    fn from(event: SceneEvent) -> Self {
        ServerMessage::Scene(event)
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        ServerMessage::Reply(reply)
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join(Collaborator),
    Update(Collaborator),
    Patch(Vec<PatchOperation>),
    PatchElements(BTreeMap<ElementId, ElementPatch>),
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
