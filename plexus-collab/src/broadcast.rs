//! Fan-out of encoded frames to the members of one room.
//!
//! Each member owns a bounded outbox. Delivery never waits: a full outbox
//! drops the frame for that member only, and a member that keeps dropping
//! (or whose outbox has closed) is evicted so the room can run its leave
//! cleanup.
//!
//! ```text
//!   room actor ──try_send──▶ [outbox A] ──▶ connection A
//!              ──try_send──▶ [outbox B] ──▶ connection B   (full: drop, count)
//!              ──try_send──▶ [outbox C] ✗ closed           (evict)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Encoded frame shared between all recipients.
pub type Outbound = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub members_evicted: u64,
    pub active_members: usize,
}

/// Lock-free counters, shared with the server's stats endpoint.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    members_evicted: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.members_evicted.load(Ordering::Relaxed)
    }
}

struct Member {
    outbox: mpsc::Sender<Outbound>,
    consecutive_drops: u32,
}

/// Members of a single room and their outboxes.
pub struct BroadcastGroup {
    members: HashMap<Uuid, Member>,
    /// Consecutive drops tolerated before a member is evicted
    max_consecutive_drops: u32,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(max_consecutive_drops: u32) -> Self {
        Self::with_stats(max_consecutive_drops, Arc::new(AtomicBroadcastStats::new()))
    }

    /// Create a group that reports into shared counters.
    pub fn with_stats(max_consecutive_drops: u32, stats: Arc<AtomicBroadcastStats>) -> Self {
        Self {
            members: HashMap::new(),
            max_consecutive_drops: max_consecutive_drops.max(1),
            stats,
        }
    }

    pub fn add_member(&mut self, conn_id: Uuid, outbox: mpsc::Sender<Outbound>) {
        self.members.insert(conn_id, Member { outbox, consecutive_drops: 0 });
    }

    pub fn remove_member(&mut self, conn_id: &Uuid) -> bool {
        self.members.remove(conn_id).is_some()
    }

    pub fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.contains_key(conn_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_ids(&self) -> Vec<Uuid> {
        self.members.keys().copied().collect()
    }

    /// Send to a single member. Returns the members evicted by this call.
    pub fn send_to(&mut self, conn_id: &Uuid, frame: Outbound) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        if let Some(member) = self.members.get_mut(conn_id) {
            if !Self::deliver(member, frame, self.max_consecutive_drops, &self.stats) {
                evicted.push(*conn_id);
            }
        }
        self.evict(&evicted);
        evicted
    }

    /// Send to every member except `except`. Returns the members evicted by
    /// this call; they are no longer part of the group.
    pub fn broadcast_except(&mut self, except: Option<&Uuid>, frame: Outbound) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        for (conn_id, member) in self.members.iter_mut() {
            if Some(conn_id) == except {
                continue;
            }
            if !Self::deliver(member, frame.clone(), self.max_consecutive_drops, &self.stats) {
                evicted.push(*conn_id);
            }
        }
        self.evict(&evicted);
        evicted
    }

    pub fn broadcast(&mut self, frame: Outbound) -> Vec<Uuid> {
        self.broadcast_except(None, frame)
    }

    /// Returns false when the member should be evicted.
    fn deliver(
        member: &mut Member,
        frame: Outbound,
        max_drops: u32,
        stats: &AtomicBroadcastStats,
    ) -> bool {
        match member.outbox.try_send(frame) {
            Ok(()) => {
                member.consecutive_drops = 0;
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                member.consecutive_drops += 1;
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                member.consecutive_drops < max_drops
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn evict(&mut self, conn_ids: &[Uuid]) {
        for conn_id in conn_ids {
            if self.members.remove(conn_id).is_some() {
                self.stats.members_evicted.fetch_add(1, Ordering::Relaxed);
                log::warn!("Evicted unresponsive member {conn_id}");
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.sent(),
            messages_dropped: self.stats.dropped(),
            members_evicted: self.stats.evicted(),
            active_members: self.members.len(),
        }
    }
}
