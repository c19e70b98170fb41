//! Persistence engine: full-state + update-log document storage.
//!
//! ```text
//!  append_updates ──▶ updates CF (doc ‖ clock)       load_state = full_state
//!                          │                                      + pending updates
//!                          ▼  compaction (older than retention)
//!                     documents CF (full_state, state_vector, lock, metadata)
//!                          │
//!                          ▼  create_snapshot / restore_snapshot
//!                     snapshots CF (doc ‖ seq), capped ring
//! ```
//!
//! Header read-modify-write cycles are serialized inside the process. The
//! persisted advisory lock additionally fences exclusive maintenance
//! (compaction, restore) against appends and full-state saves; it expires
//! after `lock_timeout` so a crashed holder cannot wedge a document.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use plexus_core::document::{DocOrigin, SharedDocument};
use uuid::Uuid;

use super::buffer::PendingUpdate;
use super::rocks::{DocumentMetadata, DocumentRecord, DocumentStore, LockState, SnapshotRecord, StoreError, UpdateRecord};
use crate::protocol::unix_millis;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Update-log length past which compaction is due
    pub compaction_threshold: usize,
    /// Updates younger than this survive compaction
    pub retention: Duration,
    /// Snapshots kept per document; the oldest is evicted first
    pub snapshot_cap: usize,
    /// Advisory locks older than this are considered abandoned
    pub lock_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 500,
            retention: Duration::from_secs(10 * 60),
            snapshot_cap: 10,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl PersistenceConfig {
    pub fn for_testing() -> Self {
        Self {
            compaction_threshold: 4,
            retention: Duration::from_secs(60),
            snapshot_cap: 3,
            lock_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    /// Updates folded into the full state and discarded
    pub folded: usize,
    /// Updates kept because they are inside the retention window
    pub retained: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub seq: u64,
    pub created_at: u64,
    pub created_by: String,
    pub description: String,
    pub size: usize,
}

impl From<&SnapshotRecord> for SnapshotInfo {
    fn from(s: &SnapshotRecord) -> Self {
        Self {
            id: s.id,
            seq: s.seq,
            created_at: s.created_at,
            created_by: s.created_by.clone(),
            description: s.description.clone(),
            size: s.bytes.len(),
        }
    }
}

/// Result of folding updates into a base state.
struct Folded {
    full_state: Vec<u8>,
    state_vector: Vec<u8>,
    element_count: u64,
}

fn fold<'a>(base: &[u8], updates: impl IntoIterator<Item = &'a [u8]>) -> Result<Folded, StoreError> {
    let mut doc = SharedDocument::new();
    if !base.is_empty() {
        doc.apply_update(base, DocOrigin::Remote)?;
    }
    for update in updates {
        doc.apply_update(update, DocOrigin::Remote)?;
    }
    Ok(Folded {
        full_state: doc.encode_state_as_update(),
        state_vector: doc.encode_state_vector(),
        element_count: doc.len() as u64,
    })
}

pub struct PersistenceEngine {
    store: DocumentStore,
    config: PersistenceConfig,
    header_guard: Mutex<()>,
}

impl PersistenceEngine {
    pub fn new(store: DocumentStore, config: PersistenceConfig) -> Self {
        Self { store, config, header_guard: Mutex::new(()) }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.header_guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Header for `doc_id`, created (empty) on first access.
    fn header(&self, doc_id: Uuid, now: u64) -> Result<DocumentRecord, StoreError> {
        if let Some(record) = self.store.get_document(doc_id)? {
            return Ok(record);
        }
        let empty = fold(&[], std::iter::empty::<&[u8]>())?;
        let record = DocumentRecord::new(doc_id, empty.full_state, empty.state_vector, now);
        self.store.put_document(&record)?;
        log::debug!("Created document record {doc_id}");
        Ok(record)
    }

    /// Held and not yet expired.
    fn lock_active(&self, lock: &LockState, now: u64) -> bool {
        lock.held && now.saturating_sub(lock.acquired_at) < self.config.lock_timeout.as_millis() as u64
    }

    /// Fails when an active lock belongs to someone other than `holder`.
    /// Plain writers pass `None` and are refused by any active lock.
    fn check_lock(&self, record: &DocumentRecord, holder: Option<&str>, now: u64) -> Result<(), StoreError> {
        let owned = holder.is_some() && record.lock.holder.as_deref() == holder;
        if self.lock_active(&record.lock, now) && !owned {
            return Err(StoreError::Locked {
                holder: record.lock.holder.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    // ─── Load / save ──────────────────────────────────────────────────

    /// Latest full state of a document with pending updates folded in.
    pub fn load_state(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let _guard = self.guard();
        let record = self.header(doc_id, unix_millis())?;
        let updates = self.store.updates(doc_id)?;
        if updates.is_empty() {
            return Ok(record.full_state);
        }
        let folded = fold(&record.full_state, updates.iter().map(|u| u.bytes.as_slice()))?;
        Ok(folded.full_state)
    }

    /// Append updates to the log in one batch. Returns the last clock used.
    pub fn append_updates(&self, doc_id: Uuid, updates: &[PendingUpdate]) -> Result<u64, StoreError> {
        self.append_updates_at(doc_id, updates, unix_millis())
    }

    /// As [`append_updates`](Self::append_updates), stamping entries with
    /// `now` (epoch millis).
    pub fn append_updates_at(
        &self,
        doc_id: Uuid,
        updates: &[PendingUpdate],
        now: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.guard();
        let mut record = self.header(doc_id, now)?;
        if updates.is_empty() {
            return Ok(record.last_clock);
        }
        self.check_lock(&record, None, now)?;

        let mut batch = self.store.batch();
        for update in updates {
            record.last_clock += 1;
            batch.put_update(
                doc_id,
                &UpdateRecord {
                    clock: record.last_clock,
                    bytes: update.bytes.clone(),
                    timestamp: now,
                    client_id: update.client_id.clone(),
                    origin: update.origin.clone(),
                },
            )?;
        }
        record.metadata.total_updates += updates.len() as u64;
        record.metadata.last_edit_at = now;
        if let Some(last) = updates.iter().rev().find_map(|u| u.client_id.clone()) {
            record.metadata.last_edit_by = Some(last);
        }
        batch.put_document(&record)?;
        self.store.write(batch)?;
        Ok(record.last_clock)
    }

    /// Atomically replace the full state with `state`, which must already
    /// contain every logged update. Logged updates older than the retention
    /// window are dropped; younger ones stay replayable.
    pub fn save_full_state(&self, doc_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        self.save_full_state_at(doc_id, state, unix_millis())
    }

    /// As [`save_full_state`](Self::save_full_state), measuring the
    /// retention window from `now` (epoch millis).
    pub fn save_full_state_at(&self, doc_id: Uuid, state: &[u8], now: u64) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut record = self.header(doc_id, now)?;
        self.check_lock(&record, None, now)?;
        let folded = fold(state, std::iter::empty::<&[u8]>())?;

        let cutoff = now.saturating_sub(self.config.retention.as_millis() as u64);
        let updates = self.store.updates(doc_id)?;
        let (old, recent): (Vec<&UpdateRecord>, Vec<&UpdateRecord>) =
            updates.iter().partition(|u| u.timestamp < cutoff);

        let mut batch = self.store.batch();
        for update in &old {
            batch.delete_update(doc_id, update.clock)?;
        }
        record.full_state = folded.full_state;
        record.state_vector = folded.state_vector;
        record.metadata.element_count = folded.element_count;
        batch.put_document(&record)?;
        self.store.write(batch)?;
        log::debug!(
            "Saved full state of {doc_id} ({} updates absorbed, {} retained)",
            old.len(),
            recent.len()
        );
        Ok(())
    }

    // ─── Compaction ───────────────────────────────────────────────────

    pub fn update_count(&self, doc_id: Uuid) -> Result<usize, StoreError> {
        Ok(self.store.updates(doc_id)?.len())
    }

    pub fn needs_compaction(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.update_count(doc_id)? > self.config.compaction_threshold)
    }

    pub fn compact(&self, doc_id: Uuid, holder: &str) -> Result<CompactionReport, StoreError> {
        self.compact_at(doc_id, holder, unix_millis())
    }

    /// Fold every update older than the retention window (relative to
    /// `now`, in epoch millis) into the full state.
    pub fn compact_at(&self, doc_id: Uuid, holder: &str, now: u64) -> Result<CompactionReport, StoreError> {
        let _guard = self.guard();
        let mut record = self.acquire(doc_id, holder, now)?;

        let cutoff = now.saturating_sub(self.config.retention.as_millis() as u64);
        let updates = self.store.updates(doc_id)?;
        let (old, recent): (Vec<&UpdateRecord>, Vec<&UpdateRecord>) =
            updates.iter().partition(|u| u.timestamp < cutoff);

        let result = (|| {
            let mut batch = self.store.batch();
            if !old.is_empty() {
                let folded = fold(&record.full_state, old.iter().map(|u| u.bytes.as_slice()))?;
                for update in &old {
                    batch.delete_update(doc_id, update.clock)?;
                }
                record.full_state = folded.full_state;
                record.state_vector = folded.state_vector;
                record.metadata.element_count = folded.element_count;
                record.metadata.compactions += 1;
            }
            record.lock = LockState::default();
            batch.put_document(&record)?;
            self.store.write(batch)
        })();

        if let Err(e) = result {
            self.release_quietly(doc_id, holder);
            return Err(e);
        }
        if !old.is_empty() {
            log::info!("Compacted {doc_id}: folded {}, retained {}", old.len(), recent.len());
        }
        Ok(CompactionReport { folded: old.len(), retained: recent.len() })
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    pub fn create_snapshot(
        &self,
        doc_id: Uuid,
        created_by: &str,
        description: &str,
    ) -> Result<SnapshotInfo, StoreError> {
        let _guard = self.guard();
        let now = unix_millis();
        let mut record = self.header(doc_id, now)?;
        let updates = self.store.updates(doc_id)?;
        let folded = fold(&record.full_state, updates.iter().map(|u| u.bytes.as_slice()))?;

        record.snapshot_seq += 1;
        let snapshot = SnapshotRecord {
            id: Uuid::new_v4(),
            seq: record.snapshot_seq,
            bytes: folded.full_state,
            state_vector: folded.state_vector,
            created_at: now,
            created_by: created_by.to_string(),
            description: description.to_string(),
        };

        let existing = self.store.snapshots(doc_id)?;
        let overflow = (existing.len() + 1).saturating_sub(self.config.snapshot_cap.max(1));

        let mut batch = self.store.batch();
        for old in existing.iter().take(overflow) {
            batch.delete_snapshot(doc_id, old.seq)?;
        }
        batch.put_snapshot(doc_id, &snapshot)?;
        batch.put_document(&record)?;
        self.store.write(batch)?;
        log::info!("Snapshot {} of {doc_id} by {created_by}", snapshot.seq);
        Ok(SnapshotInfo::from(&snapshot))
    }

    pub fn list_snapshots(&self, doc_id: Uuid) -> Result<Vec<SnapshotInfo>, StoreError> {
        Ok(self.store.snapshots(doc_id)?.iter().map(SnapshotInfo::from).collect())
    }

    /// Replace the current state with a snapshot. The update log is
    /// discarded in the same batch.
    pub fn restore_snapshot(&self, doc_id: Uuid, snapshot_id: Uuid, holder: &str) -> Result<(), StoreError> {
        let _guard = self.guard();
        let now = unix_millis();
        let snapshot = self
            .store
            .snapshots(doc_id)?
            .into_iter()
            .find(|s| s.id == snapshot_id)
            .ok_or(StoreError::SnapshotNotFound(snapshot_id))?;
        let mut record = self.acquire(doc_id, holder, now)?;

        let result = (|| {
            let folded = fold(&snapshot.bytes, std::iter::empty::<&[u8]>())?;
            let mut batch = self.store.batch();
            for update in self.store.updates(doc_id)? {
                batch.delete_update(doc_id, update.clock)?;
            }
            record.full_state = folded.full_state;
            record.state_vector = folded.state_vector;
            record.metadata.element_count = folded.element_count;
            record.metadata.last_edit_at = now;
            record.metadata.last_edit_by = Some(holder.to_string());
            record.lock = LockState::default();
            batch.put_document(&record)?;
            self.store.write(batch)
        })();

        if let Err(e) = result {
            self.release_quietly(doc_id, holder);
            return Err(e);
        }
        log::info!("Restored {doc_id} to snapshot {}", snapshot.seq);
        Ok(())
    }

    // ─── Advisory lock ────────────────────────────────────────────────

    pub fn try_lock(&self, doc_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        self.try_lock_at(doc_id, holder, unix_millis())
    }

    pub fn try_lock_at(&self, doc_id: Uuid, holder: &str, now: u64) -> Result<bool, StoreError> {
        let _guard = self.guard();
        match self.acquire(doc_id, holder, now) {
            Ok(_) => Ok(true),
            Err(StoreError::Locked { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release a lock held by `holder`. Returns false if it was not theirs.
    pub fn release_lock(&self, doc_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        let _guard = self.guard();
        let Some(mut record) = self.store.get_document(doc_id)? else {
            return Ok(false);
        };
        if !record.lock.held || record.lock.holder.as_deref() != Some(holder) {
            return Ok(false);
        }
        record.lock = LockState::default();
        self.store.put_document(&record)?;
        Ok(true)
    }

    pub fn lock_state(&self, doc_id: Uuid) -> Result<Option<LockState>, StoreError> {
        Ok(self.store.get_document(doc_id)?.map(|r| r.lock))
    }

    /// Caller holds the header guard.
    fn acquire(&self, doc_id: Uuid, holder: &str, now: u64) -> Result<DocumentRecord, StoreError> {
        let mut record = self.header(doc_id, now)?;
        self.check_lock(&record, Some(holder), now)?;
        if record.lock.held && record.lock.holder.as_deref() != Some(holder) {
            log::warn!(
                "Taking over expired lock on {doc_id} from {}",
                record.lock.holder.as_deref().unwrap_or("unknown")
            );
        }
        record.lock = LockState { held: true, holder: Some(holder.to_string()), acquired_at: now };
        self.store.put_document(&record)?;
        Ok(record)
    }

    fn release_quietly(&self, doc_id: Uuid, holder: &str) {
        let released = self.store.get_document(doc_id).and_then(|record| match record {
            Some(mut r) if r.lock.holder.as_deref() == Some(holder) => {
                r.lock = LockState::default();
                self.store.put_document(&r)
            }
            _ => Ok(()),
        });
        if let Err(e) = released {
            log::error!("Failed to release lock on {doc_id}: {e}");
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        Ok(self.store.get_document(doc_id)?.map(|r| r.metadata))
    }

    pub fn document_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.store.document_ids()
    }
}
