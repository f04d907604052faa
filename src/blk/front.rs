//! Block-front driver contract.
//!
//! The device driver itself lives outside this crate; platform bring-up
//! registers an attach hook that maps a `device/vbd/<num>` path to a driver
//! instance. Between `aio_read`/`aio_write` and the completion call the
//! driver exclusively owns the request record; completing it is the unique
//! point where ownership returns to the bridge.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Once;

use crate::sched::WaitQueue;

use super::bio::BioReq;

// ============================================================================
// Device Info
// ============================================================================

/// Geometry and access mode reported by the driver at attach time.
#[derive(Debug, Clone, Copy)]
pub struct BlkInfo {
    /// Number of sectors.
    pub sectors: u64,
    /// Sector size in bytes.
    pub sector_size: u32,
    /// Whether the media is read-only.
    pub read_only: bool,
}

impl BlkInfo {
    /// Total device size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }
}

// ============================================================================
// I/O Buffer Pointer
// ============================================================================

/// Raw I/O buffer pointer handed through the bridge to the driver.
///
/// The submitting client keeps the buffer alive and untouched until the
/// completion callback for the request has returned.
#[derive(Debug, Clone, Copy)]
pub struct IoPtr(*mut u8);

// Requests move to the poller thread; the client contract above makes the
// pointer valid there.
unsafe impl Send for IoPtr {}

impl IoPtr {
    pub const fn new(p: *mut u8) -> Self {
        IoPtr(p)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0
    }

    /// View the buffer as a slice.
    ///
    /// # Safety
    ///
    /// The pointer must reference `len` valid bytes for the duration of the
    /// borrow, with no concurrent access.
    pub unsafe fn as_slice(&self, len: usize) -> &[u8] {
        core::slice::from_raw_parts(self.0, len)
    }

    /// View the buffer as a mutable slice.
    ///
    /// # Safety
    ///
    /// As [`IoPtr::as_slice`], plus exclusive access.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_slice_mut(&self, len: usize) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.0, len)
    }
}

// ============================================================================
// Driver Contract
// ============================================================================

/// Asynchronous block-front device.
pub trait BlockFront: Send + Sync {
    /// Device geometry and mode.
    fn info(&self) -> BlkInfo;

    /// Start an asynchronous read. The driver owns `req` until completion.
    fn aio_read(&self, req: Box<BioReq>);

    /// Start an asynchronous write. The driver owns `req` until completion.
    fn aio_write(&self, req: Box<BioReq>);

    /// Drain finished requests, invoking each one's completion, and return
    /// how many completed.
    fn poll(&self) -> usize;

    /// Release the device. No requests may be outstanding.
    fn shutdown(&self);
}

/// Attach hook installed by platform bring-up.
pub type AttachFn = fn(path: &str) -> Option<Arc<dyn BlockFront>>;

static ATTACH: Once<AttachFn> = Once::new();

/// Register the driver attach hook. First caller wins.
pub fn set_attach(f: AttachFn) {
    ATTACH.call_once(|| f);
}

pub(crate) fn attach(path: &str) -> Option<Arc<dyn BlockFront>> {
    ATTACH.get().and_then(|f| f(path))
}

// Poller parking spot while completions are pending in the device.
static COMPLETION_WAITQ: WaitQueue = WaitQueue::new();

/// The driver completion wait queue. Drivers wake it when completions
/// become available.
pub fn completion_waitq() -> &'static WaitQueue {
    &COMPLETION_WAITQ
}

// ============================================================================
// Hosted RAM-backed reference driver
// ============================================================================

#[cfg(feature = "hosted")]
mod ramdisk {
    use alloc::boxed::Box;
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    use super::{completion_waitq, BlkInfo, BlockFront};
    use crate::blk::bio::BioReq;
    use crate::errno::Errno;

    /// Memory-backed block device completing requests at poll time, in
    /// submit order. Used by hosted integration tests.
    pub struct RamDisk {
        info: BlkInfo,
        data: Mutex<Vec<u8>>,
        finished: Mutex<VecDeque<(Box<BioReq>, i32)>>,
    }

    impl RamDisk {
        pub fn new(sectors: u64, sector_size: u32, read_only: bool) -> Arc<Self> {
            let size = (sectors * sector_size as u64) as usize;
            Arc::new(RamDisk {
                info: BlkInfo {
                    sectors,
                    sector_size,
                    read_only,
                },
                data: Mutex::new(vec![0u8; size]),
                finished: Mutex::new(VecDeque::new()),
            })
        }

        /// Pre-load device contents starting at a byte offset.
        pub fn load(&self, off: usize, bytes: &[u8]) {
            self.data.lock()[off..off + bytes.len()].copy_from_slice(bytes);
        }

        fn transfer(&self, req: &BioReq) -> i32 {
            let off = req.offset();
            let len = req.len();
            if off < 0 || off as u64 + len as u64 > self.info.size_bytes() {
                return Errno::Io.code();
            }
            let off = off as usize;
            let mut data = self.data.lock();
            if req.is_read() {
                // SAFETY: the submitting client keeps the buffer valid
                // until its completion callback runs.
                unsafe { req.buf().as_slice_mut(len) }.copy_from_slice(&data[off..off + len]);
            } else {
                if self.info.read_only {
                    return Errno::Io.code();
                }
                data[off..off + len].copy_from_slice(unsafe { req.buf().as_slice(len) });
            }
            0
        }

        fn finish(&self, req: Box<BioReq>, status: i32) {
            self.finished.lock().push_back((req, status));
            // A completion is available; get the poller off the wait queue.
            completion_waitq().wake_all();
        }
    }

    impl BlockFront for RamDisk {
        fn info(&self) -> BlkInfo {
            self.info
        }

        fn aio_read(&self, req: Box<BioReq>) {
            let status = self.transfer(&req);
            self.finish(req, status);
        }

        fn aio_write(&self, req: Box<BioReq>) {
            let status = self.transfer(&req);
            self.finish(req, status);
        }

        fn poll(&self) -> usize {
            let mut done = 0;
            loop {
                let next = self.finished.lock().pop_front();
                match next {
                    Some((req, status)) => {
                        req.complete(status);
                        done += 1;
                    }
                    None => break,
                }
            }
            done
        }

        fn shutdown(&self) {}
    }
}

#[cfg(feature = "hosted")]
pub use ramdisk::RamDisk;
