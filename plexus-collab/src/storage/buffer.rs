use uuid::Uuid;

use super::engine::PersistenceEngine;
use super::rocks::StoreError;

/// An update waiting to be written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub bytes: Vec<u8>,
    pub client_id: Option<String>,
    pub origin: String,
}

impl PendingUpdate {
    pub fn new(bytes: Vec<u8>, client_id: Option<String>, origin: impl Into<String>) -> Self {
        Self { bytes, client_id, origin: origin.into() }
    }
}

/// Per-room autosave buffer.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    pending: Vec<PendingUpdate>,
    failures: u32,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: PendingUpdate) {
        self.pending.push(update);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consecutive failed flushes since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Write everything buffered. On failure nothing is dropped; the same
    /// updates are attempted again on the next call.
    pub fn flush(&mut self, engine: &PersistenceEngine, doc_id: Uuid) -> Result<usize, StoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        match engine.append_updates(doc_id, &self.pending) {
            Ok(_) => {
                let written = self.pending.len();
                self.pending.clear();
                self.failures = 0;
                Ok(written)
            }
            Err(e) => {
                self.failures += 1;
                log::warn!(
                    "Autosave of {doc_id} failed ({} pending, attempt {}): {e}",
                    self.pending.len(),
                    self.failures
                );
                Err(e)
            }
        }
    }

    /// Forget buffered updates that a full-state save has absorbed.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.failures = 0;
    }
}
