//! # scene-sync: Real-time sync core for collaborative scenes
//!
//! Many clients edit one shared scene (a map of opaque elements); the
//! server reconciles their edits into one versioned state and streams
//! incremental updates back to every client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────────────────┐
//! │ Client      │ ◄────────────────► │ SyncServer                  │
//! │ (per user)  │     JSON Proto     │  └── RoomManager            │
//! └─────────────┘                    │       └── SceneRoom (id)    │
//!                                    └──────────────┬──────────────┘
//!                        ┌──────────────────────────┼───────────────────┐
//!                        ▼                          ▼                   ▼
//!                 ┌─────────────┐           ┌──────────────┐     ┌──────────────┐
//!                 │ Roster      │           │ SceneStore   │     │ Debouncer    │
//!                 │ + presence  │           │ (merge, ver) │ ──► │ → storage    │
//!                 │ Broadcast   │           │ Broadcast    │     └──────────────┘
//!                 └──────┬──────┘           └──────┬───────┘
//!                        └────── multiplex ────────┘
//!                                  │
//!                            Session stream
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire types (elements, scenes, events, messages)
//! - [`patch`]: JSON-patch operations for the structural merge
//! - [`broadcast`]: Multi-subscriber channel with unsubscribe cleanup
//! - [`multiplex`]: Fair merge of several event streams
//! - [`debounce`]: Rate-limited persistence with trailing write
//! - [`storage`]: `SceneStorage` trait, RocksDB and in-memory backends
//! - [`scene`]: Versioned scene state and the two merge strategies
//! - [`room`]: Join/leave lifecycle, roster and per-client streams
//! - [`server`]: WebSocket transport

pub mod protocol;
pub mod patch;
pub mod broadcast;
pub mod multiplex;
pub mod debounce;
pub mod storage;
pub mod scene;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, CollaborationEvent, Collaborator, Element, ElementId, ElementPatch,
    ProtocolError, Reply, Scene, SceneEvent, ServerMessage,
};
pub use patch::{PatchError, PatchErrorKind, PatchOperation};
pub use broadcast::{BroadcastChannel, BroadcastStats, Subscription};
pub use multiplex::{multiplex, Multiplexed};
pub use debounce::Debouncer;
pub use storage::{
    MemoryStorage, SceneDb, SceneMetadata, SceneStorage, StoreConfig, StoreError, StoreStats,
};
pub use scene::{Change, PatchOutcome, SceneError, SceneStore};
pub use room::{RoomConfig, RoomManager, SceneRoom, Session};
pub use server::{ServerConfig, ServerStats, SyncServer};
