//! Scheduling for statements the storage engine turned away with a
//! transient busy/locked result.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::server::cancel::CancelHandle;

/// Retry bookkeeping for one contended statement.
#[derive(Debug, Clone)]
pub struct BusyContext {
    created_at: Instant,
    /// `None` retries until the client cancels.
    deadline: Option<Instant>,
    attempts: u32,
    /// Set once a cancel request has been taken for this wait; sticky.
    cancelled: bool,
}

impl BusyContext {
    pub fn new(now: Instant, timeout: Option<Duration>) -> Self {
        Self {
            created_at: now,
            deadline: timeout.map(|timeout| now + timeout),
            attempts: 1,
            cancelled: false,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// When the statement should be attempted again; never past the deadline
    /// so the final attempt happens right as the timeout elapses.
    pub fn next_attempt(&self, now: Instant, interval: Duration) -> Instant {
        let next = now + interval;
        match self.deadline {
            Some(deadline) => next.min(deadline),
            None => next,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Moves a pending cancel request on `handle` into this wait.
    pub fn take_cancel(&mut self, handle: &CancelHandle) -> bool {
        if !self.cancelled && handle.take_request() {
            self.cancel();
        }
        self.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Per-worker min-heap of retry instants keyed by connection slot.
///
/// Rescheduling or removing a key leaves its old heap entry behind; stale
/// entries are recognised against `scheduled` and skipped when popped.
#[derive(Debug, Default)]
pub struct BusyRetryQueue {
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    scheduled: HashMap<usize, Instant>,
}

impl BusyRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: usize, at: Instant) {
        if self.scheduled.get(&key) == Some(&at) {
            return;
        }
        self.scheduled.insert(key, at);
        self.heap.push(Reverse((at, key)));
    }

    pub fn remove(&mut self, key: usize) {
        self.scheduled.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Earliest live retry instant.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.heap.peek().copied() {
            if self.scheduled.get(&key) == Some(&at) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every key due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(Reverse((at, key))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if self.scheduled.get(&key) == Some(&at) {
                self.scheduled.remove(&key);
                due.push(key);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::server::cancel::CancelRegistry;

    #[test]
    fn zero_timeout_never_expires() {
        let now = Instant::now();
        let ctx = BusyContext::new(now, None);
        assert!(!ctx.expired(now + Duration::from_secs(3600)));
        assert_eq!(
            ctx.next_attempt(now, Duration::from_millis(10)),
            now + Duration::from_millis(10)
        );
    }

    #[test]
    fn retries_are_clamped_to_the_deadline() {
        let now = Instant::now();
        let ctx = BusyContext::new(now, Some(Duration::from_millis(25)));
        let later = now + Duration::from_millis(20);
        assert!(!ctx.expired(later));
        assert_eq!(
            ctx.next_attempt(later, Duration::from_millis(10)),
            now + Duration::from_millis(25)
        );
        assert!(ctx.expired(now + Duration::from_millis(25)));
        assert_eq!(ctx.waited(later), Duration::from_millis(20));
    }

    #[test]
    fn cancel_request_is_taken_once_and_stays_with_the_wait() {
        let registry = CancelRegistry::new();
        let handle = Arc::new(CancelHandle::new(41));
        registry.register(Arc::clone(&handle));
        handle.enter_busy_wait();

        let mut ctx = BusyContext::new(Instant::now(), None);
        assert!(!ctx.take_cancel(&handle));
        assert!(!ctx.is_cancelled());

        assert!(registry.cancel(41, handle.secret_key()));
        ctx.record_attempt();
        assert!(ctx.take_cancel(&handle));
        assert!(ctx.is_cancelled());
        // the request was consumed; the context remembers it
        assert!(!handle.take_request());
        assert!(ctx.take_cancel(&handle));
        assert_eq!(ctx.attempts(), 2);
    }

    #[test]
    fn queue_pops_due_keys_in_time_order() {
        let base = Instant::now();
        let mut queue = BusyRetryQueue::new();
        queue.schedule(3, base + Duration::from_millis(30));
        queue.schedule(1, base + Duration::from_millis(10));
        queue.schedule(2, base + Duration::from_millis(20));

        assert_eq!(queue.next_due(), Some(base + Duration::from_millis(10)));
        assert_eq!(queue.pop_due(base + Duration::from_millis(20)), vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(base + Duration::from_millis(25)).is_empty());
    }

    #[test]
    fn rescheduled_and_removed_keys_skip_stale_entries() {
        let base = Instant::now();
        let mut queue = BusyRetryQueue::new();
        queue.schedule(1, base + Duration::from_millis(5));
        queue.schedule(1, base + Duration::from_millis(50));
        queue.schedule(2, base + Duration::from_millis(6));
        queue.remove(2);

        assert_eq!(queue.next_due(), Some(base + Duration::from_millis(50)));
        assert!(queue.pop_due(base + Duration::from_millis(10)).is_empty());
        assert_eq!(queue.pop_due(base + Duration::from_millis(50)), vec![1]);
        assert!(queue.is_empty());
        assert_eq!(queue.next_due(), None);
    }
}
