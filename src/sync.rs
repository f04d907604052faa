//! Scheduler-integrated synchronization.
//!
//! Spin-type mutex and condition variable for cooperative single-CPU use.
//! The uncontended mutex path is a bare compare-and-swap; contention parks
//! the caller in the scheduler, which is the only way another thread can be
//! holding the lock. The `_nowrap` variants skip the kernel lock dance and
//! are for callers that hold no guest-kernel locks (the poller thread).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::hyper;
use crate::sched::{self, Thread};

// ============================================================================
// Mutex
// ============================================================================

/// Spin-type mutex. Blocks through the scheduler on contention.
pub struct KMutex {
    locked: AtomicBool,
    waiters: Mutex<VecDeque<Arc<Thread>>>,
}

impl KMutex {
    pub const fn new() -> Self {
        KMutex {
            locked: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire without blocking. Returns whether the lock was taken.
    pub fn try_enter(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn lock_slow(&self) {
        let me = sched::current_thread();
        loop {
            if self.try_enter() {
                return;
            }
            self.waiters.lock().push_back(me.clone());
            sched::block(&me);
            sched::schedule();
            self.waiters.lock().retain(|t| !Arc::ptr_eq(t, &me));
        }
    }

    /// Acquire, performing the kernel lock dance around any blocking.
    pub fn enter(&self) {
        if self.try_enter() {
            return;
        }
        let nlocks = hyper::kernel_unsched();
        self.lock_slow();
        hyper::kernel_sched(nlocks);
    }

    /// Acquire without the kernel lock dance.
    pub fn enter_nowrap(&self) {
        if !self.try_enter() {
            self.lock_slow();
        }
    }

    /// Release, waking the first parked waiter if any.
    pub fn exit(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed), "unlock of free mutex");
        self.locked.store(false, Ordering::Release);
        let waiter = self.waiters.lock().pop_front();
        if let Some(w) = waiter {
            sched::wake(&w);
        }
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Condition Variable
// ============================================================================

/// Condition variable over [`KMutex`]. Signals are edge-triggered; waiters
/// recheck their predicate after every wake.
pub struct KCondVar {
    waiters: Mutex<VecDeque<Arc<Thread>>>,
}

impl KCondVar {
    pub const fn new() -> Self {
        KCondVar {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Release `m`, block until signalled, reacquire `m`. No kernel lock
    /// dance.
    pub fn wait_nowrap(&self, m: &KMutex) {
        let me = sched::current_thread();
        self.waiters.lock().push_back(me.clone());
        m.exit();
        sched::block(&me);
        sched::schedule();
        self.waiters.lock().retain(|t| !Arc::ptr_eq(t, &me));
        m.enter_nowrap();
    }

    /// As [`KCondVar::wait_nowrap`], with the kernel lock dance around the
    /// block.
    pub fn wait(&self, m: &KMutex) {
        let nlocks = hyper::kernel_unsched();
        self.wait_nowrap(m);
        hyper::kernel_sched(nlocks);
    }

    /// Wake the first waiter, if any. Call with the associated mutex held.
    pub fn signal(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(w) = waiter {
            sched::wake(&w);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let waiters: Vec<_> = {
            let mut q = self.waiters.lock();
            q.drain(..).collect()
        };
        for w in waiters {
            sched::wake(&w);
        }
    }
}

impl Default for KCondVar {
    fn default() -> Self {
        Self::new()
    }
}
