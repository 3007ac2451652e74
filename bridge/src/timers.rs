//! One-shot timers owned by the controller task

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Pending one-shot timers, fired in deadline order
///
/// Entries with equal deadlines fire in the order they were scheduled.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(Instant, u64), T>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `payload` once `after` has elapsed
    pub fn schedule(&mut self, after: Duration, payload: T) {
        self.schedule_at(Instant::now() + after, payload);
    }

    pub fn schedule_at(&mut self, deadline: Instant, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), payload);
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest entry if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        let (&(deadline, _), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.pop_first().map(|(_, payload)| payload)
    }

    /// Drop every entry for which `keep` returns false
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|_, payload| keep(payload));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
