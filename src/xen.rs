//! Hypervisor collaborator hooks.
//!
//! The core never talks to the hypervisor directly; the platform bring-up
//! code registers this table once during boot. The hosted build installs
//! defaults backed by a mock monotonic clock whose `block_domain` jumps time
//! forward to the requested wake-up, which makes timed-sleep behavior
//! deterministic under test.

use crate::types::Nanos;
use spin::Once;

/// Function table wired to the hypervisor by platform bring-up.
pub struct XenOps {
    /// Monotonic clock, nanoseconds since an arbitrary epoch.
    pub monotonic_now: fn() -> Nanos,
    /// Park the virtual CPU until the given absolute time or an event.
    pub block_domain: fn(until: Nanos),
    /// Force processing of pending event-channel callbacks.
    pub force_evtchn: fn(),
    /// Raw console byte sink.
    pub console_write: fn(&[u8]),
    /// Shut the domain down. Does not return.
    pub halt: fn() -> !,
}

static OPS: Once<XenOps> = Once::new();

/// Register the hypervisor hook table. First caller wins.
pub fn set_ops(ops: XenOps) {
    OPS.call_once(|| ops);
}

fn ops() -> &'static XenOps {
    OPS.call_once(default_ops)
}

/// Current monotonic time in nanoseconds.
pub fn now() -> Nanos {
    (ops().monotonic_now)()
}

/// Park the CPU until `until` or the next event.
pub fn block_domain(until: Nanos) {
    (ops().block_domain)(until)
}

/// Force event-channel processing.
pub fn force_evtchn() {
    (ops().force_evtchn)()
}

/// Write bytes to the hypervisor console.
pub fn console_write(bytes: &[u8]) {
    (ops().console_write)(bytes)
}

/// Halt the domain.
pub fn halt() -> ! {
    (ops().halt)()
}

#[cfg(feature = "hosted")]
mod hosted {
    use super::XenOps;
    use crate::types::Nanos;
    use core::sync::atomic::{AtomicU64, Ordering};

    // Mock monotonic clock. Only block_domain advances it, so hosted time
    // moves exactly when every thread is waiting for it to. Starts one
    // second past the epoch; zero is the "no timeout" sentinel.
    static CLOCK: AtomicU64 = AtomicU64::new(crate::types::NSEC_PER_SEC);

    fn monotonic_now() -> Nanos {
        CLOCK.load(Ordering::SeqCst)
    }

    fn block_domain(until: Nanos) {
        CLOCK.fetch_max(until, Ordering::SeqCst);
    }

    fn force_evtchn() {}

    fn console_write(bytes: &[u8]) {
        std::print!("{}", alloc::string::String::from_utf8_lossy(bytes));
    }

    fn halt() -> ! {
        panic!("domain halted");
    }

    pub(super) fn default_ops() -> XenOps {
        XenOps {
            monotonic_now,
            block_domain,
            force_evtchn,
            console_write,
            halt,
        }
    }
}

#[cfg(feature = "hosted")]
use hosted::default_ops;

#[cfg(not(feature = "hosted"))]
fn default_ops() -> XenOps {
    // A port must call set_ops() during bring-up; these placeholders keep
    // early console traffic from faulting before that happens.
    fn monotonic_now() -> Nanos {
        0
    }
    fn block_domain(_until: Nanos) {}
    fn force_evtchn() {}
    fn console_write(_bytes: &[u8]) {}
    fn halt() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
    XenOps {
        monotonic_now,
        block_domain,
        force_evtchn,
        console_write,
        halt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_domain_advances_clock() {
        let t0 = now();
        block_domain(t0 + 1_000_000);
        assert!(now() >= t0 + 1_000_000);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let t0 = now();
        // Blocking until a time already in the past must not rewind.
        block_domain(t0.saturating_sub(1));
        assert!(now() >= t0);
    }
}
