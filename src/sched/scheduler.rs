//! The cooperative scheduler.
//!
//! Non-preemptive round robin on a single virtual CPU. The run queue holds
//! every live thread; order encodes priority, head runs next among the
//! runnable. A thread runs until it blocks, sleeps, joins or exits, and the
//! queue, the exited list and the join wait-list are serialized by the
//! interrupt gate.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, Once};

use crate::irq;
use crate::machdep::{self, ThreadEntry, ThreadMd};
use crate::types::{self, Nanos};
use crate::xen;

use super::thread::{Stack, Thread, ThreadFlags, ThreadId};

/// Hook invoked with `(prev.cookie, next.cookie)` immediately before each
/// context switch.
pub type SchedHook = fn(prev_cookie: usize, next_cookie: usize);

/// A thread parked in `join_thread`, waiting for its target to latch JOINED.
struct JoinWaiter {
    waiter: Arc<Thread>,
    wanted: ThreadId,
}

struct SchedState {
    /// Every live thread, in round-robin order. The running thread stays on
    /// the queue; exited threads are not here.
    run_queue: VecDeque<Arc<Thread>>,
    /// Exited threads awaiting reap, most recent first.
    exited: VecDeque<Arc<Thread>>,
    /// Join wait-list. A thread appears at most once as a waiter.
    joinwq: Vec<JoinWaiter>,
    next_id: u64,
}

impl SchedState {
    fn new() -> Self {
        SchedState {
            run_queue: VecDeque::new(),
            exited: VecDeque::new(),
            joinwq: Vec::new(),
            next_id: 1,
        }
    }

    /// One scheduling scan: wake expired sleepers seen before the first
    /// runnable thread, track the earliest pending wake-up, and rotate the
    /// first runnable thread to the tail, returning it.
    ///
    /// The scan stops at the first runnable thread, as the round-robin
    /// discipline requires; sleepers behind it are examined on a later pass.
    fn select_next(&mut self, now: Nanos) -> (Option<Arc<Thread>>, Nanos) {
        let mut min_wakeup = now + types::secs(10);
        let mut found = None;
        for (i, t) in self.run_queue.iter().enumerate() {
            if !t.is_runnable() {
                let wk = t.wakeup_time();
                if wk != 0 {
                    if wk <= now {
                        t.set_flag(ThreadFlags::TIMEDOUT);
                        t.set_wakeup_time(0);
                        t.set_runnable();
                    } else if wk < min_wakeup {
                        min_wakeup = wk;
                    }
                }
            }
            if t.is_runnable() {
                found = Some(i);
                break;
            }
        }
        let next = found.map(|i| {
            let t = self.run_queue.remove(i).expect("scan index in range");
            self.run_queue.push_back(t.clone());
            t
        });
        (next, min_wakeup)
    }
}

/// Scheduler instance. One per domain.
pub struct Scheduler {
    state: Mutex<SchedState>,
    current: Mutex<Option<Arc<Thread>>>,
    hook: Mutex<Option<SchedHook>>,
    threads_started: AtomicBool,
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            state: Mutex::new(SchedState::new()),
            current: Mutex::new(None),
            hook: Mutex::new(None),
            threads_started: AtomicBool::new(false),
        }
    }

    /// The thread executing right now.
    pub fn current_thread(&self) -> Arc<Thread> {
        self.current
            .lock()
            .clone()
            .expect("scheduler not initialized")
    }

    fn alloc_id(&self) -> ThreadId {
        let mut st = self.state.lock();
        let id = ThreadId(st.next_id);
        st.next_id += 1;
        id
    }

    /// Adopt the boot context as a live, runnable thread.
    fn adopt_boot(&self) {
        let id = self.alloc_id();
        let t = Arc::new(Thread::new(id, "boot", 0, Stack::Adopted, ThreadMd::new()));
        t.set_runnable();
        {
            let _g = irq::save();
            self.state.lock().run_queue.push_back(t.clone());
        }
        *self.current.lock() = Some(t);
    }

    /// Create a thread and append it to the run queue in runnable state.
    ///
    /// With `stack` supplied, the caller owns the stack's lifetime and the
    /// descriptor carries EXTSTACK; otherwise the scheduler allocates and
    /// later frees one.
    pub fn create_thread(
        &self,
        name: &str,
        cookie: usize,
        entry: ThreadEntry,
        arg: usize,
        stack: Option<(usize, usize)>,
    ) -> Arc<Thread> {
        let id = self.alloc_id();
        let stack = match stack {
            Some((base, size)) => Stack::External { base, size },
            None => Thread::alloc_stack(),
        };
        let t = Arc::new(Thread::new(id, name, cookie, stack, ThreadMd::new()));
        t.set_runnable();
        {
            let _g = irq::save();
            self.state.lock().run_queue.push_back(t.clone());
        }
        machdep::launch(&t.md, name, entry, arg);
        t
    }

    /// Main dispatch.
    ///
    /// Picks the next runnable thread, parking the CPU until the earliest
    /// pending wake-up when there is none, switches to it, and afterwards
    /// reaps exited threads other than the caller. Fatal if invoked from a
    /// callback or with interrupts already masked.
    pub fn schedule(&self) {
        if irq::in_callback() {
            crate::bug!("schedule() called from a callback");
        }
        if irq::masked() {
            crate::bug!("schedule() called with interrupts masked");
        }
        let prev = self.current_thread();
        let next = loop {
            let guard = irq::save();
            let now = xen::now();
            let (next, min_wakeup) = self.state.lock().select_next(now);
            drop(guard);
            if let Some(next) = next {
                break next;
            }
            // Nothing runnable: park until the next timeout expires, then
            // let pending events in before rescanning.
            xen::block_domain(min_wakeup);
            xen::force_evtchn();
        };
        if !Arc::ptr_eq(&prev, &next) {
            self.switch_to(&prev, &next);
        }
        self.reap(&prev);
    }

    fn switch_to(&self, prev: &Arc<Thread>, next: &Arc<Thread>) {
        let hook = *self.hook.lock();
        if let Some(hook) = hook {
            hook(prev.cookie(), next.cookie());
        }
        *self.current.lock() = Some(next.clone());
        machdep::switch(&prev.md, &next.md);
    }

    /// Free exited threads other than `prev`: descriptor and, unless
    /// EXTSTACK, the stack.
    fn reap(&self, prev: &Arc<Thread>) {
        let mut reaped = Vec::new();
        {
            let _g = irq::save();
            let mut st = self.state.lock();
            let mut i = 0;
            while i < st.exited.len() {
                if Arc::ptr_eq(&st.exited[i], prev) {
                    i += 1;
                } else {
                    reaped.push(st.exited.remove(i).expect("reap index in range"));
                }
            }
        }
        drop(reaped);
    }

    /// Make `t` non-runnable with no timeout armed. Does not reschedule.
    pub fn block(&self, t: &Thread) {
        t.set_wakeup_time(0);
        t.clear_runnable();
    }

    /// Make `t` runnable, cancelling any pending timeout.
    pub fn wake(&self, t: &Thread) {
        t.set_wakeup_time(0);
        t.set_runnable();
    }

    fn dosleep(&self, wakeup: Nanos) -> bool {
        let t = self.current_thread();
        {
            let _g = irq::save();
            t.set_wakeup_time(wakeup);
            t.clear_flag(ThreadFlags::TIMEDOUT);
            t.clear_runnable();
        }
        self.schedule();
        let timed_out = t.has_flag(ThreadFlags::TIMEDOUT);
        t.clear_flag(ThreadFlags::TIMEDOUT);
        timed_out
    }

    /// Sleep for `ms` milliseconds. Returns true iff the timer fired rather
    /// than an explicit wake.
    pub fn msleep(&self, ms: u64) -> bool {
        self.dosleep(xen::now() + types::millis(ms))
    }

    /// Sleep until `ms` milliseconds past the clock epoch. Same result
    /// convention as [`Scheduler::msleep`].
    pub fn absmsleep(&self, ms: u64) -> bool {
        self.dosleep(types::millis(ms))
    }

    /// Terminate the calling thread. Gates until joined when MUSTJOIN is
    /// set, then moves to the exited list and schedules away for good.
    pub fn exit_thread(&self) -> ! {
        let thread = self.current_thread();
        loop {
            {
                let guard = irq::save();
                if !thread.has_flag(ThreadFlags::MUSTJOIN) {
                    let mut st = self.state.lock();
                    if let Some(pos) = st
                        .run_queue
                        .iter()
                        .position(|t| Arc::ptr_eq(t, &thread))
                    {
                        st.run_queue.remove(pos);
                    }
                    thread.clear_runnable();
                    st.exited.push_front(thread.clone());
                    drop(st);
                    drop(guard);
                    break;
                }
                thread.set_flag(ThreadFlags::JOINED);
            }
            // See whether the joiner is already parked for us.
            let waiter = {
                let st = self.state.lock();
                st.joinwq
                    .iter()
                    .find(|w| w.wanted == thread.id)
                    .map(|w| w.waiter.clone())
            };
            if let Some(w) = waiter {
                self.wake(&w);
            }
            self.block(&thread);
            self.schedule();
        }
        loop {
            self.schedule();
            crate::println!("schedule() returned to an exited thread, retrying");
        }
    }

    /// Wait for `target` to exit. Requires MUSTJOIN on the target; at most
    /// one joiner per target is supported.
    pub fn join_thread(&self, target: &Arc<Thread>) {
        let me = self.current_thread();
        {
            let _g = irq::save();
            if !target.has_flag(ThreadFlags::MUSTJOIN) {
                crate::bug!("join of thread \"{}\" which is not joinable", target.name());
            }
        }
        loop {
            {
                let _g = irq::save();
                if target.has_flag(ThreadFlags::JOINED) {
                    target.clear_flag(ThreadFlags::MUSTJOIN);
                    break;
                }
            }
            self.state.lock().joinwq.push(JoinWaiter {
                waiter: me.clone(),
                wanted: target.id,
            });
            self.block(&me);
            self.schedule();
            self.state
                .lock()
                .joinwq
                .retain(|w| !Arc::ptr_eq(&w.waiter, &me));
        }
        // Let the exiting thread out of its gate.
        self.wake(target);
    }

    /// Install the context-switch hook.
    pub fn set_hook(&self, hook: SchedHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Whether the idle thread has run at least once.
    pub fn threads_started(&self) -> bool {
        self.threads_started.load(Ordering::SeqCst)
    }

    /// Number of live threads on the run queue.
    pub fn thread_count(&self) -> usize {
        self.state.lock().run_queue.len()
    }

    /// Dump the run queue to the console.
    pub fn print_runqueue(&self) {
        let st = self.state.lock();
        for t in st.run_queue.iter() {
            crate::println!("   Thread \"{}\", runnable={}", t.name(), t.is_runnable());
        }
        crate::println!();
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static SCHEDULER: Once<Scheduler> = Once::new();

/// Get the global scheduler.
pub fn global_scheduler() -> &'static Scheduler {
    SCHEDULER.get().expect("scheduler not initialized")
}

fn idle_fn(_arg: usize) {
    let sched = global_scheduler();
    sched.threads_started.store(true, Ordering::SeqCst);
    loop {
        let current = sched.current_thread();
        sched.block(&current);
        sched.schedule();
    }
}

/// Initialize the scheduler: adopt the boot context and create the idle
/// thread. Idempotent.
pub fn init_sched() {
    let mut fresh = false;
    let sched = SCHEDULER.call_once(|| {
        fresh = true;
        Scheduler::new()
    });
    if fresh {
        crate::println!("Initialising scheduler");
        sched.adopt_boot();
        sched.create_thread("Idle", 0, idle_fn, 0, None);
    }
}

/// Attach the guest kernel's main lwp cookie to the current thread.
pub fn init_mainlwp(cookie: usize) -> Arc<Thread> {
    let t = global_scheduler().current_thread();
    t.set_cookie(cookie);
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkthread(id: u64, name: &str) -> Arc<Thread> {
        Arc::new(Thread::new(
            ThreadId(id),
            name,
            0,
            Stack::Adopted,
            ThreadMd::new(),
        ))
    }

    fn state_with(threads: &[&Arc<Thread>]) -> SchedState {
        let mut st = SchedState::new();
        for t in threads {
            st.run_queue.push_back(Arc::clone(t));
        }
        st
    }

    #[test]
    fn test_rotation_is_round_robin() {
        let a = mkthread(1, "a");
        let b = mkthread(2, "b");
        let c = mkthread(3, "c");
        for t in [&a, &b, &c] {
            t.set_runnable();
        }
        let mut st = state_with(&[&a, &b, &c]);
        // Three continuously runnable threads: each picked once per window
        // of three selections, in queue order.
        let mut picked = Vec::new();
        for _ in 0..6 {
            let (next, _) = st.select_next(1_000);
            picked.push(next.unwrap().id);
        }
        assert_eq!(
            picked,
            [
                ThreadId(1),
                ThreadId(2),
                ThreadId(3),
                ThreadId(1),
                ThreadId(2),
                ThreadId(3)
            ]
        );
    }

    #[test]
    fn test_expired_sleeper_wakes_with_timedout() {
        let s = mkthread(1, "sleeper");
        s.set_wakeup_time(500);
        let mut st = state_with(&[&s]);
        let (next, _) = st.select_next(1_000);
        let next = next.unwrap();
        assert!(Arc::ptr_eq(&next, &s));
        assert!(s.has_flag(ThreadFlags::TIMEDOUT));
        assert!(s.is_runnable());
        assert_eq!(s.wakeup_time(), 0);
    }

    #[test]
    fn test_pending_sleeper_bounds_wakeup() {
        let s = mkthread(1, "sleeper");
        s.set_wakeup_time(5_000);
        let mut st = state_with(&[&s]);
        let (next, min_wakeup) = st.select_next(1_000);
        assert!(next.is_none());
        assert_eq!(min_wakeup, 5_000);
        assert!(!s.is_runnable());
    }

    #[test]
    fn test_idle_bound_is_ten_seconds() {
        let s = mkthread(1, "blocked");
        let mut st = state_with(&[&s]);
        let now = 1_000;
        let (next, min_wakeup) = st.select_next(now);
        assert!(next.is_none());
        assert_eq!(min_wakeup, now + types::secs(10));
    }

    #[test]
    fn test_scan_stops_at_first_runnable() {
        let r = mkthread(1, "runner");
        r.set_runnable();
        let s = mkthread(2, "sleeper");
        s.set_wakeup_time(500);
        let mut st = state_with(&[&r, &s]);
        let (next, _) = st.select_next(1_000);
        assert_eq!(next.unwrap().id, ThreadId(1));
        // The expired sleeper sits behind the runnable thread; it is woken
        // on a later pass, not this one.
        assert!(!s.has_flag(ThreadFlags::TIMEDOUT));
    }

    #[test]
    fn test_wake_is_idempotent() {
        let sched = Scheduler::new();
        let t = mkthread(1, "t");
        t.set_wakeup_time(123);
        sched.wake(&t);
        assert!(t.is_runnable());
        assert_eq!(t.wakeup_time(), 0);
        sched.wake(&t);
        assert!(t.is_runnable());
        assert_eq!(t.wakeup_time(), 0);
    }

    #[test]
    fn test_block_then_wake_restores_runnable() {
        let sched = Scheduler::new();
        let t = mkthread(1, "t");
        t.set_runnable();
        sched.block(&t);
        assert!(!t.is_runnable());
        assert_eq!(t.wakeup_time(), 0);
        sched.wake(&t);
        assert!(t.is_runnable());
        assert_eq!(t.wakeup_time(), 0);
    }
}
