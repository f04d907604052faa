//! Host-thread-backed context switching.
//!
//! Each guest thread owns a run gate; `switch` opens the next thread's gate
//! and then waits on the previous thread's. Exactly one gate is open at a
//! time, so guest threads execute strictly one-at-a-time regardless of host
//! scheduling.

use alloc::string::String;
use alloc::sync::Arc;
use std::sync::{Condvar, Mutex};

use super::ThreadEntry;

struct RunGate {
    may_run: Mutex<bool>,
    cv: Condvar,
}

impl RunGate {
    fn new() -> Self {
        RunGate {
            may_run: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut run = self.may_run.lock().unwrap();
        while !*run {
            run = self.cv.wait(run).unwrap();
        }
        *run = false;
    }

    fn open(&self) {
        let mut run = self.may_run.lock().unwrap();
        *run = true;
        self.cv.notify_one();
    }
}

/// Per-thread machine-dependent state.
pub struct ThreadMd {
    gate: Arc<RunGate>,
}

impl ThreadMd {
    pub(crate) fn new() -> Self {
        ThreadMd {
            gate: Arc::new(RunGate::new()),
        }
    }
}

/// Start a guest thread. It parks until the scheduler switches to it, runs
/// its entry, then exits through the scheduler.
pub fn launch(md: &ThreadMd, name: &str, entry: ThreadEntry, arg: usize) {
    let gate = md.gate.clone();
    std::thread::Builder::new()
        .name(String::from(name))
        .spawn(move || {
            gate.wait();
            entry(arg);
            crate::sched::exit_thread();
        })
        .expect("failed to back guest thread with a host thread");
}

/// Transfer control from `prev` to `next`. Returns when `prev` is next
/// switched back to.
pub fn switch(prev: &ThreadMd, next: &ThreadMd) {
    next.gate.open();
    prev.gate.wait();
}
