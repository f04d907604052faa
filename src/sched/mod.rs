//! Cooperative scheduling.
//!
//! Thread descriptors, the round-robin scheduler, and the wait-queue
//! primitive built on it.

pub mod scheduler;
pub mod thread;
pub mod waitq;

pub use scheduler::{global_scheduler, init_mainlwp, init_sched, SchedHook, Scheduler};
pub use thread::{Thread, ThreadFlags, ThreadId};
pub use waitq::WaitQueue;

use alloc::sync::Arc;
use crate::machdep::ThreadEntry;

/// The thread executing right now.
pub fn current_thread() -> Arc<Thread> {
    global_scheduler().current_thread()
}

/// Create a thread; see [`Scheduler::create_thread`].
pub fn create_thread(
    name: &str,
    cookie: usize,
    entry: ThreadEntry,
    arg: usize,
    stack: Option<(usize, usize)>,
) -> Arc<Thread> {
    global_scheduler().create_thread(name, cookie, entry, arg, stack)
}

/// Yield to the scheduler; see [`Scheduler::schedule`].
pub fn schedule() {
    global_scheduler().schedule()
}

/// See [`Scheduler::block`].
pub fn block(t: &Thread) {
    global_scheduler().block(t)
}

/// See [`Scheduler::wake`].
pub fn wake(t: &Thread) {
    global_scheduler().wake(t)
}

/// See [`Scheduler::msleep`].
pub fn msleep(ms: u64) -> bool {
    global_scheduler().msleep(ms)
}

/// See [`Scheduler::absmsleep`].
pub fn absmsleep(ms: u64) -> bool {
    global_scheduler().absmsleep(ms)
}

/// See [`Scheduler::exit_thread`].
pub fn exit_thread() -> ! {
    global_scheduler().exit_thread()
}

/// See [`Scheduler::join_thread`].
pub fn join_thread(target: &Arc<Thread>) {
    global_scheduler().join_thread(target)
}

/// Install the context-switch hook.
pub fn set_sched_hook(hook: SchedHook) {
    global_scheduler().set_hook(hook)
}

/// Whether the idle thread has run at least once.
pub fn threads_started() -> bool {
    global_scheduler().threads_started()
}
