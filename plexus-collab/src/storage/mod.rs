//! Persistence layer for collaborative documents.
//!
//! ## Architecture
//!
//! ```text
//! room actor ──▶ UpdateBuffer ──(room tick)──▶ PersistenceEngine::append_updates
//!                                                     │
//!                                                     ▼
//!                                      DocumentStore (RocksDB, LZ4 records)
//!                                                     ▲
//! maintenance task ──▶ compaction / backup snapshots ─┘
//! ```
//!
//! A failed flush leaves the buffered updates in place; the next tick
//! retries them, so the live room is never blocked on storage.

pub mod buffer;
pub mod engine;
pub mod rocks;

pub use buffer::{PendingUpdate, UpdateBuffer};
pub use engine::{CompactionReport, PersistenceConfig, PersistenceEngine, SnapshotInfo};
pub use rocks::{
    DocumentMetadata, DocumentRecord, DocumentStore, LockState, SnapshotRecord, StoreBatch,
    StoreConfig, StoreError, UpdateRecord,
};
