//! The block I/O bridge.
//!
//! Submissions look synchronous to the guest kernel but complete through a
//! dedicated poller thread. Submit builds a request record, hands it to the
//! driver, bumps the outstanding counters and signals the poller; the poller
//! drains every device with outstanding requests and the driver calls back
//! into [`biocomp`] for each finished record, which runs the user callback
//! and drops the counters.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Once;

use crate::hyper;
use crate::irq;
use crate::sched;
use crate::sync::{KCondVar, KMutex};

use super::front::{self, IoPtr};
use super::{BLKFDOFF, NBLKDEV};

// ============================================================================
// Operation Flags
// ============================================================================

/// Block I/O operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BioOp(u32);

impl BioOp {
    /// Read from the device.
    pub const READ: Self = Self(0x01);
    /// Write to the device.
    pub const WRITE: Self = Self(0x02);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_read(self) -> bool {
        (self.0 & Self::READ.0) != 0
    }
}

/// Completion callback: `(arg, transferred bytes, errno)`.
pub type BioDoneFn = fn(arg: usize, nbytes: usize, error: i32);

// ============================================================================
// Request Record
// ============================================================================

/// One in-flight block I/O request.
///
/// Allocated at submit, owned by the driver until it completes the record,
/// then freed by the completion hook after the user callback returns.
pub struct BioReq {
    slot: usize,
    buf: IoPtr,
    len: usize,
    off: i64,
    op: BioOp,
    done: BioDoneFn,
    arg: usize,
}

impl BioReq {
    /// Buffer this request reads into or writes from.
    pub fn buf(&self) -> IoPtr {
        self.buf
    }

    /// Transfer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Byte offset on the device.
    pub fn offset(&self) -> i64 {
        self.off
    }

    pub fn is_read(&self) -> bool {
        self.op.is_read()
    }

    /// Driver-side completion: hand the record back to the bridge.
    /// `error` is zero for success, nonzero for a transfer failure.
    pub fn complete(self: Box<Self>, error: i32) {
        biocomp(self, error)
    }
}

// ============================================================================
// Bridge Globals
// ============================================================================

static BIO_MTX: KMutex = KMutex::new();
static BIO_CV: KCondVar = KCondVar::new();
// Written only under BIO_MTX; atomic so the poller predicate can load it.
static BIO_OUTSTANDING_TOTAL: AtomicU32 = AtomicU32::new(0);
static BIO_POLLER: Once<()> = Once::new();

/// Total requests currently in flight across all devices.
pub fn outstanding_total() -> u32 {
    BIO_OUTSTANDING_TOTAL.load(Ordering::SeqCst)
}

// ============================================================================
// Submit Path
// ============================================================================

/// Submit an asynchronous block I/O request.
///
/// `fd` must be a descriptor from a successful open. The buffer must stay
/// valid until `done` has been invoked; `done` fires exactly once, with the
/// transferred byte count on success or `(0, EIO)` on a driver error.
pub fn bio(fd: i32, op: BioOp, buf: IoPtr, len: usize, off: i64, done: BioDoneFn, arg: usize) {
    let slot = fd - BLKFDOFF;
    if slot < 0 || slot as usize >= NBLKDEV {
        crate::bug!("bio submit on invalid descriptor {}", fd);
    }
    let slot = slot as usize;
    let dev = match super::device(slot) {
        Some(dev) => dev,
        None => crate::bug!("bio submit on closed descriptor {}", fd),
    };

    let nlocks = hyper::kernel_unsched();

    BIO_POLLER.call_once(|| {
        sched::create_thread("biopoll", 0, biothread, 0, None);
    });

    let req = Box::new(BioReq {
        slot,
        buf,
        len,
        off,
        op,
        done,
        arg,
    });

    if op.is_read() {
        dev.aio_read(req);
    } else {
        dev.aio_write(req);
    }

    BIO_MTX.enter();
    BIO_OUTSTANDING_TOTAL.fetch_add(1, Ordering::SeqCst);
    super::outstanding_inc(slot);
    BIO_CV.signal();
    BIO_MTX.exit();

    hyper::kernel_sched(nlocks);
}

// ============================================================================
// Completion Hook
// ============================================================================

/// Invoked by the driver, on the poller thread, once per request. Runs the
/// user callback under the guest kernel lock, frees the record, then drops
/// the outstanding counters.
fn biocomp(req: Box<BioReq>, error: i32) {
    hyper::kernel_sched(0);
    if error != 0 {
        (req.done)(req.arg, 0, crate::errno::Errno::Io.code());
    } else {
        (req.done)(req.arg, req.len, 0);
    }
    let _ = hyper::kernel_unsched();

    let slot = req.slot;
    drop(req);

    BIO_MTX.enter_nowrap();
    BIO_OUTSTANDING_TOTAL.fetch_sub(1, Ordering::SeqCst);
    super::outstanding_dec(slot);
    BIO_MTX.exit();
}

// ============================================================================
// Poller Thread
// ============================================================================

/// Body of the dedicated poller thread.
///
/// Sleeps on the condition variable until requests are in flight, then
/// drains every device with a nonzero outstanding count. The `did > 0`
/// recheck, not the CV, is the authoritative drain condition: a spurious
/// signal just costs one empty pass.
fn biothread(_arg: usize) {
    // Establish a lightweight-process identity for the completion
    // callbacks this thread will run.
    hyper::poller_attach_lwp();

    loop {
        BIO_MTX.enter_nowrap();
        while outstanding_total() == 0 {
            BIO_CV.wait_nowrap(&BIO_MTX);
        }
        BIO_MTX.exit();

        // The driver's completion wait queue interacts with event delivery,
        // so polling runs masked; rescheduling must not.
        let mut guard = irq::save();
        loop {
            let mut did = 0;
            for slot in 0..NBLKDEV {
                if super::outstanding(slot) > 0 {
                    if let Some(dev) = super::device(slot) {
                        did += dev.poll();
                    }
                }
            }
            if did > 0 {
                break;
            }
            let me = sched::current_thread();
            front::completion_waitq().wait_prepare(&me);
            drop(guard);
            sched::schedule();
            front::completion_waitq().remove(&me);
            guard = irq::save();
        }
        drop(guard);
    }
}
