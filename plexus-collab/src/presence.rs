//! Awareness: ephemeral per-client presence (cursor, selection, name).
//!
//! Presence is never persisted. Each client owns one entry keyed by its
//! numeric client id and bumps a clock on every change; receivers keep the
//! entry with the highest clock. A `None` state at an equal or higher clock
//! removes the client.
//!
//! ```text
//! LocalAwareness::set_state()
//!       │  (rate-limited)
//!       ▼
//! AWARENESS frame ──▶ room PresenceState::apply() ──▶ relay accepted entries
//!                                                      to the other members
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{AwarenessEntry, AwarenessUpdate};

#[derive(Debug, Clone)]
struct ClientPresence {
    clock: u32,
    state: Option<String>,
    updated_at: Instant,
}

/// Presence table for one room.
#[derive(Debug, Default)]
pub struct PresenceState {
    clients: HashMap<u64, ClientPresence>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming update; returns the entries that changed anything,
    /// which are the ones worth relaying.
    pub fn apply(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessUpdate {
        let mut accepted = Vec::new();
        for entry in &update.entries {
            let newer = match self.clients.get(&entry.client_id) {
                None => entry.state.is_some(),
                Some(existing) => {
                    entry.clock > existing.clock
                        || (entry.clock == existing.clock
                            && entry.state.is_none()
                            && existing.state.is_some())
                }
            };
            if !newer {
                continue;
            }
            self.clients.insert(
                entry.client_id,
                ClientPresence { clock: entry.clock, state: entry.state.clone(), updated_at: now },
            );
            accepted.push(entry.clone());
        }
        self.clients.retain(|_, c| c.state.is_some());
        AwarenessUpdate { entries: accepted }
    }

    /// Remove the given clients, returning the removal update to relay.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> AwarenessUpdate {
        let entries = client_ids
            .iter()
            .filter_map(|id| {
                self.clients.remove(id).map(|c| AwarenessEntry {
                    client_id: *id,
                    clock: c.clock.wrapping_add(1),
                    state: None,
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Full snapshot of every live client.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .map(|(id, c)| AwarenessEntry { client_id: *id, clock: c.clock, state: c.state.clone() })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate { entries }
    }

    /// Drop clients that have not refreshed within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> AwarenessUpdate {
        let stale: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.updated_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove_clients(&stale)
    }

    pub fn state(&self, client_id: u64) -> Option<&str> {
        self.clients.get(&client_id).and_then(|c| c.state.as_deref())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The local client's own awareness entry.
#[derive(Debug)]
pub struct LocalAwareness {
    client_id: u64,
    clock: u32,
    state: Option<String>,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl LocalAwareness {
    pub fn new(client_id: u64, min_interval: Duration) -> Self {
        Self { client_id, clock: 0, state: None, min_interval, last_sent: None }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Replace the local state. Returns the update to send, or `None` when
    /// rate-limited; a suppressed state still goes out with the next
    /// `refresh`.
    pub fn set_state(&mut self, state: String, now: Instant) -> Option<AwarenessUpdate> {
        self.clock = self.clock.wrapping_add(1);
        self.state = Some(state);
        let due = self
            .last_sent
            .map(|t| now.saturating_duration_since(t) >= self.min_interval)
            .unwrap_or(true);
        if !due {
            return None;
        }
        self.last_sent = Some(now);
        Some(self.current())
    }

    /// Re-announce the current state (keeps it from expiring remotely).
    pub fn refresh(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        self.state.as_ref()?;
        self.last_sent = Some(now);
        Some(self.current())
    }

    /// Announce that this client is gone.
    pub fn clear(&mut self) -> AwarenessUpdate {
        self.clock = self.clock.wrapping_add(1);
        self.state = None;
        self.current()
    }

    fn current(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.client_id,
                clock: self.clock,
                state: self.state.clone(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client_id: u64, clock: u32, state: Option<&str>) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry { client_id, clock, state: state.map(str::to_string) }],
        }
    }

    #[test]
    fn test_higher_clock_wins() {
        let now = Instant::now();
        let mut p = PresenceState::new();
        assert_eq!(p.apply(&entry(1, 2, Some("a")), now).entries.len(), 1);
        assert!(p.apply(&entry(1, 1, Some("old")), now).is_empty());
        assert!(p.apply(&entry(1, 2, Some("same clock")), now).is_empty());
        assert_eq!(p.state(1), Some("a"));
        assert_eq!(p.apply(&entry(1, 3, Some("b")), now).entries.len(), 1);
        assert_eq!(p.state(1), Some("b"));
    }

    #[test]
    fn test_removal_at_equal_clock() {
        let now = Instant::now();
        let mut p = PresenceState::new();
        p.apply(&entry(5, 4, Some("x")), now);
        let relayed = p.apply(&entry(5, 4, None), now);
        assert_eq!(relayed.entries.len(), 1);
        assert!(p.is_empty());
    }

    #[test]
    fn test_unknown_removal_ignored() {
        let mut p = PresenceState::new();
        assert!(p.apply(&entry(9, 1, None), Instant::now()).is_empty());
    }

    #[test]
    fn test_remove_clients_bumps_clock() {
        let now = Instant::now();
        let mut p = PresenceState::new();
        p.apply(&entry(1, 7, Some("a")), now);
        p.apply(&entry(2, 1, Some("b")), now);
        let removal = p.remove_clients(&[1, 3]);
        assert_eq!(removal.entries, vec![AwarenessEntry { client_id: 1, clock: 8, state: None }]);
        assert_eq!(p.snapshot().entries.len(), 1);
    }

    #[test]
    fn test_expire_stale_clients() {
        let start = Instant::now();
        let mut p = PresenceState::new();
        p.apply(&entry(1, 1, Some("a")), start);
        p.apply(&entry(2, 1, Some("b")), start + Duration::from_secs(20));
        let removed = p.expire(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(removed.entries.len(), 1);
        assert_eq!(removed.entries[0].client_id, 1);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_local_rate_limit() {
        let start = Instant::now();
        let mut local = LocalAwareness::new(42, Duration::from_millis(33));
        assert!(local.set_state("{}".into(), start).is_some());
        assert!(local.set_state("{\"x\":1}".into(), start + Duration::from_millis(5)).is_none());
        let refreshed = local.refresh(start + Duration::from_millis(6)).unwrap();
        assert_eq!(refreshed.entries[0].clock, 2);
        assert_eq!(refreshed.entries[0].state.as_deref(), Some("{\"x\":1}"));

        let cleared = local.clear();
        assert_eq!(cleared.entries[0].clock, 3);
        assert!(cleared.entries[0].state.is_none());
        assert!(local.refresh(start + Duration::from_secs(1)).is_none());
    }
}
