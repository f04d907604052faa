//! Interrupt gate.
//!
//! Scoped, nestable masking used as the mutual-exclusion primitive on the
//! single virtual CPU. Only the outermost guard actually transitions the
//! mask; inner guards just bump the nesting depth. Run-queue, exited-list
//! and thread-flag mutation must happen while a guard is held.
//!
//! The in-callback flag is owned by the hypervisor event layer; the
//! scheduler consults it to reject re-entry from callback context.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static DEPTH: AtomicU32 = AtomicU32::new(0);
static IN_CALLBACK: AtomicBool = AtomicBool::new(false);

/// RAII interrupt mask. Restores the previous mask level on drop.
///
/// Not `Send`: the mask belongs to the context that took it.
pub struct IrqGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        let prev = DEPTH.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unbalanced interrupt unmask");
    }
}

/// Mask interrupts, returning a guard that unmasks on drop. Nestable.
pub fn save() -> IrqGuard {
    DEPTH.fetch_add(1, Ordering::SeqCst);
    IrqGuard {
        _not_send: PhantomData,
    }
}

/// Current nesting depth of the mask.
pub fn depth() -> u32 {
    DEPTH.load(Ordering::SeqCst)
}

/// Whether interrupts are currently masked.
pub fn masked() -> bool {
    depth() > 0
}

/// Event layer entry: mark the CPU as running a callback.
pub fn enter_callback() {
    IN_CALLBACK.store(true, Ordering::SeqCst);
}

/// Event layer exit: clear the callback marker.
pub fn leave_callback() {
    IN_CALLBACK.store(false, Ordering::SeqCst);
}

/// Whether the CPU is currently inside an event callback.
pub fn in_callback() -> bool {
    IN_CALLBACK.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting() {
        // Relative to the ambient depth; other tests may hold guards.
        let d0 = depth();
        {
            let _outer = save();
            assert_eq!(depth(), d0 + 1);
            {
                let _inner = save();
                assert_eq!(depth(), d0 + 2);
            }
            assert_eq!(depth(), d0 + 1);
        }
        assert_eq!(depth(), d0);
    }

    #[test]
    fn test_callback_flag() {
        assert!(!in_callback());
        enter_callback();
        assert!(in_callback());
        leave_callback();
        assert!(!in_callback());
    }
}
