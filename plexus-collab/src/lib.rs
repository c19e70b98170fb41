//! # plexus-collab: real-time collaboration server and client provider
//!
//! Relays diagram document updates between editors over WebSocket and
//! keeps every document durable in RocksDB.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │  Provider   │ ◄────────────────► │  SyncServer  │
//! │ (per user)  │   framed protocol  │  (central)   │
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │ one actor per document
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐     ┌────────────────┐
//! │ SyncBridge  │                    │     Room     │ ──► │ SessionService │
//! │ (plexus-    │                    │ yrs Doc +    │     └────────────────┘
//! │  core)      │                    │ presence     │     ┌────────────────┐
//! └─────────────┘                    │ + broadcast  │ ──► │ Persistence    │
//!                                    └──────────────┘     │ Engine (Rocks) │
//!                                                         └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: frame codec: varint kind + payload
//! - [`broadcast`]: per-room fan-out with bounded member queues
//! - [`presence`]: awareness state with clock ordering and expiry
//! - [`auth`]: AUTH handshake hook and roles
//! - [`room`]: room actors and the registry that spawns them
//! - [`session`]: session lifecycle, participants, locks, comments
//! - [`storage`]: RocksDB records, compaction, snapshots, autosave buffer
//! - [`server`]: WebSocket sync server and maintenance task
//! - [`client`]: reconnecting client provider with offline queue

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AllowAll, AuthError, Authenticator, Grant, StaticTokens};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{
    Backoff, ClientConfig, ClientError, ConnectionStatus, OfflineQueue, Provider, ProviderEvent,
    ProviderMetrics,
};
pub use presence::{LocalAwareness, PresenceState};
pub use protocol::{
    AuthRequest, AwarenessEntry, AwarenessUpdate, CustomMessage, ErrorCode, ErrorMessage, Frame,
    MessageKind, Notification, ProtocolError, Role, SyncMessage,
};
pub use room::{RoomConfig, RoomError, RoomRegistry, RoomSnapshot};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{EndReason, Session, SessionConfig, SessionError, SessionService};
pub use storage::{
    DocumentStore, PersistenceConfig, PersistenceEngine, SnapshotInfo, StoreConfig, StoreError,
};
