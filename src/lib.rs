//! PvCore - cooperative scheduling and block I/O plumbing for hosting a
//! guest kernel on a paravirtualized domain.
//!
//! One virtual CPU, many threads, no preemption: threads run until they
//! block, sleep, join or exit. Block devices complete asynchronously through
//! a dedicated poller thread bridged to synchronous-looking submissions.
//! Hypervisor services, the block-front driver and the context-switch
//! machinery are collaborators behind registered hooks; the default `hosted`
//! feature supplies std-backed stand-ins so the whole core runs under
//! `cargo test`.

#![cfg_attr(not(feature = "hosted"), no_std)]
#![allow(clippy::new_without_default)]
// A request record's length is its transfer size, not a container count
#![allow(clippy::len_without_is_empty)]

extern crate alloc;

// Core types
pub mod errno;
pub mod types;

// Output and fatal diagnostics
pub mod console;
pub mod panic;

// Collaborator seams
pub mod machdep;
pub mod xen;

// Kernel primitives
pub mod irq;
pub mod mem;
pub mod sched;
pub mod sync;

// Device and glue surface
pub mod blk;
pub mod hyper;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name.
pub const NAME: &str = "pvcore";

/// Bring the core up: scheduler with boot context adopted and idle thread
/// created. Hypervisor and driver hooks are registered separately by
/// platform bring-up. Idempotent.
pub fn init() {
    sched::init_sched();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        assert_eq!(NAME, "pvcore");
        assert!(!VERSION.is_empty());
    }
}
