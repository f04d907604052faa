//! The hypercall surface consumed by the hosted guest kernel.
//!
//! `init` validates the protocol version and stores the guest kernel's
//! upcall table; the rest are the thin adapters the guest uses for clocks,
//! memory, console output and device access. Every operation that may
//! suspend outside the guest kernel releases the guest's kernel locks first
//! and reacquires them on return (the kernel lock dance).

pub mod params;

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use spin::Once;

use crate::errno::Errno;
use crate::irq;
use crate::mem;
use crate::sched::{self, Thread};
use crate::types::{Nanos, NSEC_PER_MSEC, NSEC_PER_SEC};
use crate::xen;

pub use params::getparam;

/// Hypercall protocol version this layer implements. `init` refuses
/// anything else.
pub const HYPERCALL_VERSION: i32 = 17;

// ============================================================================
// Guest Kernel Upcalls
// ============================================================================

/// Callbacks into the guest kernel, stored at [`init`] time.
#[derive(Clone, Copy)]
pub struct HyperUp {
    /// Enter the guest kernel on the current thread.
    pub schedule: fn(),
    /// Leave the guest kernel.
    pub unschedule: fn(),
    /// Drop every kernel lock the caller holds, returning how many.
    pub backend_unschedule: fn() -> usize,
    /// Reacquire `nlocks` kernel locks.
    pub backend_schedule: fn(nlocks: usize),
    /// Create a lightweight process for the current thread.
    pub lwproc_newlwp: fn(pid: u64) -> i32,
}

static HYPERUP: Once<HyperUp> = Once::new();

/// Validate the protocol version and store the guest upcall table. Exactly
/// one successful call is expected.
pub fn init(version: i32, hyp: HyperUp) -> Result<(), Errno> {
    if version != HYPERCALL_VERSION {
        crate::println!(
            "Unsupported hypercall version requested, {} vs {}",
            version,
            HYPERCALL_VERSION
        );
        return Err(Errno::Inval);
    }
    HYPERUP.call_once(|| hyp);
    Ok(())
}

/// Drop the caller's guest kernel locks, returning the count for
/// [`kernel_sched`].
pub fn kernel_unsched() -> usize {
    match HYPERUP.get() {
        Some(h) => (h.backend_unschedule)(),
        None => 0,
    }
}

/// Reacquire `nlocks` guest kernel locks.
pub fn kernel_sched(nlocks: usize) {
    if let Some(h) = HYPERUP.get() {
        (h.backend_schedule)(nlocks)
    }
}

/// Give the calling thread a guest lwp identity. Used once by the poller
/// thread before it starts running completion callbacks.
pub(crate) fn poller_attach_lwp() {
    if let Some(h) = HYPERUP.get() {
        (h.schedule)();
        (h.lwproc_newlwp)(0);
        (h.unschedule)();
    }
}

// ============================================================================
// Console
// ============================================================================

/// Emit one character on the hypervisor console.
pub fn putchar(c: u8) {
    xen::console_write(&[c]);
}

/// Formatted diagnostic output from the guest kernel.
pub fn dprintf(args: fmt::Arguments) {
    crate::console::print(args);
}

// ============================================================================
// Clocks
// ============================================================================

/// Clock selector for [`clock_sleep`]. Wall and monotonic clocks share the
/// same epoch here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    /// Sleep for a relative wall-clock duration.
    RelWall,
    /// Sleep until an absolute monotonic time.
    AbsMono,
}

/// Read the clock as (seconds, nanoseconds-within-second).
pub fn clock_gettime(_which: ClockType) -> (i64, u64) {
    let t: Nanos = xen::now();
    ((t / NSEC_PER_SEC) as i64, t % NSEC_PER_SEC)
}

/// Sleep per the clock selector. The kernel lock dance wraps the suspend.
pub fn clock_sleep(which: ClockType, sec: i64, nsec: u64) {
    let nlocks = kernel_unsched();
    match which {
        ClockType::RelWall => {
            let ms = sec as u64 * 1_000 + nsec / NSEC_PER_MSEC;
            sched::msleep(ms);
        }
        ClockType::AbsMono => {
            let t = sched::current_thread();
            {
                let _g = irq::save();
                t.set_wakeup_time(sec as u64 * NSEC_PER_SEC + nsec);
                t.clear_runnable();
            }
            sched::schedule();
        }
    }
    kernel_sched(nlocks);
}

// ============================================================================
// Memory
// ============================================================================

/// Allocate guest memory; see [`mem::alloc`].
pub fn malloc(len: usize, align: usize) -> Result<NonNull<u8>, Errno> {
    mem::alloc(len, align)
}

/// Free guest memory; see [`mem::free`].
///
/// # Safety
///
/// `ptr` must come from [`malloc`] with the same `len`.
pub unsafe fn free(ptr: NonNull<u8>, len: usize) {
    mem::free(ptr, len)
}

// ============================================================================
// Misc
// ============================================================================

/// Fill `buf` with weakly random bytes derived from the clock. Returns the
/// number of bytes written. Not suitable for anything secret.
pub fn getrandom(buf: &mut [u8]) -> usize {
    for b in buf.iter_mut() {
        *b = (xen::now() & 0xff) as u8;
    }
    buf.len()
}

/// Terminate the domain.
pub fn exit() -> ! {
    xen::halt()
}

/// Set the current thread's error slot.
pub fn seterrno(err: i32) {
    sched::current_thread().set_errno(err);
}

/// Read the current thread's error slot.
pub fn geterrno() -> i32 {
    sched::current_thread().errno()
}

/// Adopt the calling context as the guest's main lwp.
pub fn init_mainlwp(cookie: usize) -> Arc<Thread> {
    sched::init_mainlwp(cookie)
}

// Device surface.
pub use crate::blk::{close, getfileinfo, open};
pub use crate::blk::bio::bio;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        fn nop() {}
        fn nop_unsched() -> usize {
            0
        }
        fn nop_sched(_n: usize) {}
        fn nop_newlwp(_pid: u64) -> i32 {
            0
        }
        let hyp = HyperUp {
            schedule: nop,
            unschedule: nop,
            backend_unschedule: nop_unsched,
            backend_schedule: nop_sched,
            lwproc_newlwp: nop_newlwp,
        };
        assert_eq!(init(HYPERCALL_VERSION - 1, hyp), Err(Errno::Inval));
        assert_eq!(init(HYPERCALL_VERSION, hyp), Ok(()));
    }

    #[test]
    fn test_clock_gettime_splits_nanos() {
        let (sec, nsec) = clock_gettime(ClockType::AbsMono);
        assert!(sec >= 0);
        assert!(nsec < NSEC_PER_SEC);
    }

    #[test]
    fn test_getrandom_fills() {
        let mut buf = [0u8; 16];
        assert_eq!(getrandom(&mut buf), 16);
    }
}
