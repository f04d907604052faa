//! Per-resource wait queues.
//!
//! A thread parks itself on the queue of the resource it needs, blocks, and
//! schedules; whoever makes the resource ready wakes the whole queue. The
//! waiter removes itself after resuming, whatever woke it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::thread::Thread;

/// Queue of threads waiting on one resource.
pub struct WaitQueue {
    waiters: Mutex<Vec<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue `t` and block it. The caller schedules afterwards.
    pub fn wait_prepare(&self, t: &Arc<Thread>) {
        self.waiters.lock().push(t.clone());
        super::global_scheduler().block(t);
    }

    /// Drop `t` from the queue. Called by the waiter after it resumes.
    pub fn remove(&self, t: &Arc<Thread>) {
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, t));
    }

    /// Wake every waiter. The queue is left intact; waiters remove
    /// themselves.
    pub fn wake_all(&self) {
        let waiters = self.waiters.lock();
        for w in waiters.iter() {
            super::global_scheduler().wake(w);
        }
    }

    /// Number of parked waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
