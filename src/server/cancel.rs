//! Out-of-band query cancellation.
//!
//! A CancelRequest arrives on a fresh socket, usually served by a different
//! worker than the target connection, so everything here is shared through
//! atomics and a concurrent map.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::engine::InterruptHandle;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const BUSY_WAITING: u8 = 2;

/// Cancel state of one connection, shared with the registry.
pub struct CancelHandle {
    process_id: u32,
    secret_key: u32,
    requested: AtomicBool,
    activity: AtomicU8,
    interrupt: Mutex<Option<Arc<dyn InterruptHandle>>>,
}

impl CancelHandle {
    pub fn new(process_id: u32) -> Self {
        Self {
            process_id,
            secret_key: OsRng.next_u32(),
            requested: AtomicBool::new(false),
            activity: AtomicU8::new(IDLE),
            interrupt: Mutex::new(None),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    pub fn set_interrupt(&self, handle: Arc<dyn InterruptHandle>) {
        *self.interrupt.lock() = Some(handle);
    }

    /// A new task starts; requests aimed at earlier work are dropped.
    pub fn begin_task(&self) {
        self.requested.store(false, Ordering::SeqCst);
        self.activity.store(RUNNING, Ordering::SeqCst);
    }

    pub fn enter_running(&self) {
        self.activity.store(RUNNING, Ordering::SeqCst);
    }

    pub fn enter_busy_wait(&self) {
        self.activity.store(BUSY_WAITING, Ordering::SeqCst);
    }

    pub fn enter_idle(&self) {
        self.activity.store(IDLE, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Consumes a pending cancel request.
    pub fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    fn request(&self) {
        match self.activity.load(Ordering::SeqCst) {
            BUSY_WAITING => {
                self.requested.store(true, Ordering::SeqCst);
                debug!(conn_id = self.process_id, "cancel flagged for busy-waiting statement");
            }
            RUNNING => {
                // the flag covers the window where the engine call already returned busy
                self.requested.store(true, Ordering::SeqCst);
                if let Some(handle) = self.interrupt.lock().as_ref() {
                    handle.interrupt();
                }
                debug!(conn_id = self.process_id, "cancel interrupted running statement");
            }
            _ => {
                debug!(conn_id = self.process_id, "cancel ignored for idle connection");
            }
        }
    }
}

#[derive(Default)]
pub struct CancelRegistry {
    entries: DashMap<u32, Arc<CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<CancelHandle>) {
        self.entries.insert(handle.process_id(), handle);
    }

    pub fn unregister(&self, process_id: u32) {
        self.entries.remove(&process_id);
    }

    /// Unknown ids and wrong secrets are ignored without a trace visible to
    /// the requester. Returns whether the request reached a connection.
    pub fn cancel(&self, process_id: u32, secret_key: u32) -> bool {
        let Some(handle) = self
            .entries
            .get(&process_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(conn_id = process_id, "cancel request for unknown connection");
            return false;
        };
        if handle.secret_key() != secret_key {
            debug!(conn_id = process_id, "cancel request with wrong secret");
            return false;
        }
        info!(conn_id = process_id, "cancel request accepted");
        handle.request();
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingInterrupt(AtomicUsize);

    impl InterruptHandle for CountingInterrupt {
        fn interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registered(id: u32) -> (CancelRegistry, Arc<CancelHandle>) {
        let registry = CancelRegistry::new();
        let handle = Arc::new(CancelHandle::new(id));
        registry.register(Arc::clone(&handle));
        (registry, handle)
    }

    #[test]
    fn wrong_secret_and_unknown_id_are_ignored() {
        let (registry, handle) = registered(4);
        handle.enter_busy_wait();
        assert!(!registry.cancel(4, handle.secret_key().wrapping_add(1)));
        assert!(!registry.cancel(99, handle.secret_key()));
        assert!(!handle.take_request());
    }

    #[test]
    fn busy_waiting_connection_gets_flagged() {
        let (registry, handle) = registered(5);
        handle.begin_task();
        handle.enter_busy_wait();
        assert!(registry.cancel(5, handle.secret_key()));
        assert!(handle.take_request());
        assert!(!handle.take_request());
    }

    #[test]
    fn running_connection_is_interrupted() {
        let (registry, handle) = registered(6);
        let interrupt = Arc::new(CountingInterrupt::default());
        handle.set_interrupt(interrupt.clone());
        handle.begin_task();
        assert!(registry.cancel(6, handle.secret_key()));
        assert_eq!(interrupt.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_connection_ignores_cancel() {
        let (registry, handle) = registered(7);
        let interrupt = Arc::new(CountingInterrupt::default());
        handle.set_interrupt(interrupt.clone());
        assert!(registry.cancel(7, handle.secret_key()));
        assert!(!handle.take_request());
        assert_eq!(interrupt.0.load(Ordering::SeqCst), 0);

        registry.unregister(7);
        assert!(registry.is_empty());
    }
}
