//! Thread descriptors.
//!
//! A descriptor lives on the run queue from creation until the thread
//! exits, then briefly on the exited list until another thread's scheduler
//! invocation reaps it. Flag and wake-up-time mutation happens with
//! interrupts masked.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::machdep::{self, ThreadMd};
use crate::types::Nanos;

// ============================================================================
// Thread Flags
// ============================================================================

/// Thread state flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadFlags(pub u32);

impl ThreadFlags {
    /// Thread may be picked by the scheduler.
    pub const RUNNABLE: Self = Self(0x01);
    /// Thread must be joined before it may exit.
    pub const MUSTJOIN: Self = Self(0x02);
    /// Thread has reached its exit gate and latched for the joiner.
    pub const JOINED: Self = Self(0x04);
    /// Stack is owned by the creator, not the scheduler.
    pub const EXTSTACK: Self = Self(0x08);
    /// Last sleep ended via the timer rather than an explicit wake.
    pub const TIMEDOUT: Self = Self(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

// ============================================================================
// Thread Identifier
// ============================================================================

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

// ============================================================================
// Stack Ownership
// ============================================================================

/// Stack backing a thread.
pub(crate) enum Stack {
    /// Allocated at creation, freed when the descriptor is reaped.
    Owned(Box<[u8]>),
    /// Supplied by the creator, who keeps ownership (EXTSTACK).
    External { base: usize, size: usize },
    /// The boot context runs on whatever stack it arrived on.
    Adopted,
}

// ============================================================================
// Thread Descriptor
// ============================================================================

/// A guest thread.
pub struct Thread {
    /// Thread identifier.
    pub id: ThreadId,
    /// Thread name, for diagnostics.
    name: String,
    /// Stack extent.
    stack: Stack,
    /// Machine-dependent context.
    pub(crate) md: ThreadMd,
    /// Flag bits. Mutated under the interrupt gate.
    flags: AtomicU32,
    /// Absolute wake-up time in nanoseconds; 0 means no timeout armed.
    wakeup_time: AtomicU64,
    /// Opaque cookie handed to the scheduler hook at each switch.
    cookie: AtomicUsize,
    /// Opaque lightweight-process pointer owned by the glue layer.
    lwp: AtomicUsize,
    /// Per-thread error slot for the glue layer.
    errno: AtomicI32,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: &str, cookie: usize, stack: Stack, md: ThreadMd) -> Self {
        let ext = matches!(stack, Stack::External { .. });
        let t = Thread {
            id,
            name: String::from(name),
            stack,
            md,
            flags: AtomicU32::new(0),
            wakeup_time: AtomicU64::new(0),
            cookie: AtomicUsize::new(cookie),
            lwp: AtomicUsize::new(0),
            errno: AtomicI32::new(0),
        };
        if ext {
            t.set_flag(ThreadFlags::EXTSTACK);
        }
        t
    }

    /// Allocate an owned stack for a new thread.
    pub(crate) fn alloc_stack() -> Stack {
        Stack::Owned(vec![0u8; machdep::STACK_SIZE].into_boxed_slice())
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address and size of the stack extent.
    pub fn stack_extent(&self) -> (usize, usize) {
        match &self.stack {
            Stack::Owned(b) => (b.as_ptr() as usize, b.len()),
            Stack::External { base, size } => (*base, *size),
            Stack::Adopted => (0, 0),
        }
    }

    // === Flags ===

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags(self.flags.load(Ordering::SeqCst))
    }

    pub fn has_flag(&self, f: ThreadFlags) -> bool {
        self.flags().contains(f)
    }

    pub(crate) fn set_flag(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    pub fn is_runnable(&self) -> bool {
        self.has_flag(ThreadFlags::RUNNABLE)
    }

    pub(crate) fn set_runnable(&self) {
        self.set_flag(ThreadFlags::RUNNABLE);
    }

    pub(crate) fn clear_runnable(&self) {
        self.clear_flag(ThreadFlags::RUNNABLE);
    }

    /// Mark the thread joinable: it will gate in exit until joined.
    /// Must be called before the thread can reach its exit.
    pub fn set_must_join(&self) {
        self.set_flag(ThreadFlags::MUSTJOIN);
    }

    // === Wake-up time ===

    pub fn wakeup_time(&self) -> Nanos {
        self.wakeup_time.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wakeup_time(&self, t: Nanos) {
        self.wakeup_time.store(t, Ordering::SeqCst);
    }

    // === Glue-owned slots ===

    pub fn cookie(&self) -> usize {
        self.cookie.load(Ordering::SeqCst)
    }

    pub fn set_cookie(&self, c: usize) {
        self.cookie.store(c, Ordering::SeqCst);
    }

    pub fn lwp(&self) -> usize {
        self.lwp.load(Ordering::SeqCst)
    }

    pub fn set_lwp(&self, l: usize) {
        self.lwp.store(l, Ordering::SeqCst);
    }

    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::SeqCst)
    }

    pub fn set_errno(&self, e: i32) {
        self.errno.store(e, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_algebra() {
        let f = ThreadFlags(ThreadFlags::RUNNABLE.bits() | ThreadFlags::MUSTJOIN.bits());
        assert!(f.contains(ThreadFlags::RUNNABLE));
        assert!(f.contains(ThreadFlags::MUSTJOIN));
        assert!(!f.contains(ThreadFlags::JOINED));
    }

    #[test]
    fn test_descriptor_state() {
        let t = Thread::new(
            ThreadId(1),
            "worker",
            0xbeef,
            Thread::alloc_stack(),
            ThreadMd::new(),
        );
        assert_eq!(t.name(), "worker");
        assert_eq!(t.cookie(), 0xbeef);
        assert!(!t.is_runnable());
        t.set_runnable();
        assert!(t.is_runnable());
        t.clear_runnable();
        assert!(!t.is_runnable());
        assert_eq!(t.wakeup_time(), 0);
    }

    #[test]
    fn test_external_stack_flag() {
        let t = Thread::new(
            ThreadId(2),
            "ext",
            0,
            Stack::External {
                base: 0x1000,
                size: 0x4000,
            },
            ThreadMd::new(),
        );
        assert!(t.has_flag(ThreadFlags::EXTSTACK));
        assert_eq!(t.stack_extent(), (0x1000, 0x4000));
    }

    #[test]
    fn test_errno_slot() {
        let t = Thread::new(ThreadId(3), "e", 0, Stack::Adopted, ThreadMd::new());
        assert_eq!(t.errno(), 0);
        t.set_errno(5);
        assert_eq!(t.errno(), 5);
    }
}
