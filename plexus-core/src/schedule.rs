//! Cancellable deferred tasks driven by an explicit clock.
//!
//! The bridge never sleeps; callers pass `now` into [`Scheduler::advance`]
//! and get back every task whose deadline has passed. This keeps the
//! bridge deterministic under test and lets an async host drive it from a
//! `tokio::time::interval`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Debug)]
pub struct Scheduler<T> {
    now: Instant,
    next_id: u64,
    tasks: BTreeMap<(Instant, u64), T>,
    index: HashMap<u64, Instant>,
}

impl<T> Scheduler<T> {
    pub fn new(now: Instant) -> Self {
        Self { now, next_id: 0, tasks: BTreeMap::new(), index: HashMap::new() }
    }

    /// Last time passed to [`advance`](Self::advance).
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn schedule_in(&mut self, delay: Duration, task: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = self.now + delay;
        self.tasks.insert((deadline, id), task);
        self.index.insert(id, deadline);
        TaskId(id)
    }

    /// Cancel a task. Returns it if it had not fired yet.
    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let deadline = self.index.remove(&id.0)?;
        self.tasks.remove(&(deadline, id.0))
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.index.contains_key(&id.0)
    }

    /// Move the clock forward and pop every due task in deadline order.
    ///
    /// Tasks with equal deadlines fire in scheduling order.
    pub fn advance(&mut self, now: Instant) -> Vec<(TaskId, T)> {
        if now > self.now {
            self.now = now;
        }
        let mut due = Vec::new();
        while let Some(entry) = self.tasks.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > self.now {
                break;
            }
            let task = entry.remove();
            self.index.remove(&id);
            due.push((TaskId(id), task));
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// At most one acquisition per window.
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_fires_due_tasks_in_order() {
        let start = Instant::now();
        let mut s = Scheduler::new(start);
        s.schedule_in(Duration::from_millis(20), "b");
        s.schedule_in(Duration::from_millis(10), "a");
        s.schedule_in(Duration::from_millis(20), "c");

        assert!(s.advance(start + Duration::from_millis(5)).is_empty());
        let fired: Vec<_> = s
            .advance(start + Duration::from_millis(20))
            .into_iter()
            .map(|(_, t)| t)
            .collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut s = Scheduler::new(start);
        let id = s.schedule_in(Duration::from_millis(10), 1);
        assert!(s.is_scheduled(id));
        assert_eq!(s.cancel(id), Some(1));
        assert_eq!(s.cancel(id), None);
        assert!(s.advance(start + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let start = Instant::now();
        let mut s: Scheduler<()> = Scheduler::new(start + Duration::from_secs(1));
        s.advance(start);
        assert_eq!(s.now(), start + Duration::from_secs(1));
    }

    #[test]
    fn test_cooldown_window() {
        let start = Instant::now();
        let mut c = Cooldown::new(Duration::from_secs(5));
        assert!(c.try_acquire(start));
        assert!(!c.try_acquire(start + Duration::from_secs(4)));
        assert!(c.try_acquire(start + Duration::from_secs(5)));
    }
}
