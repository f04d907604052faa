//! Block devices.
//!
//! Ten fixed slots expose paravirtual block devices to the guest kernel as
//! descriptors `64 + slot` under the names `blk0`..`blk9`. The slot table
//! (device handle, info, open count) is touched only from the submitting
//! side; the poller reads only the outstanding counters.

pub mod bio;
pub mod front;

use alloc::sync::Arc;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::errno::Errno;
use crate::hyper;

use self::front::{BlkInfo, BlockFront};

/// Number of device slots.
pub const NBLKDEV: usize = 10;

/// Descriptor offset: slot `n` is descriptor `BLKFDOFF + n`.
pub const BLKFDOFF: i32 = 64;

// ============================================================================
// Open Flags
// ============================================================================

/// Open mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Read-only access.
    pub const RDONLY: Self = Self(0x00);
    /// Write-only access.
    pub const WRONLY: Self = Self(0x01);
    /// Read-write access.
    pub const RDWR: Self = Self(0x02);
    /// Access-mode subfield mask.
    pub const ACCMODE: Self = Self(0x03);
    /// Block I/O descriptor. Required; this core serves nothing else.
    pub const BIO: Self = Self(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// The access-mode subfield.
    pub const fn accmode(self) -> Self {
        Self(self.0 & Self::ACCMODE.0)
    }

    pub const fn wants_write(self) -> bool {
        let acc = self.accmode().0;
        acc == Self::WRONLY.0 || acc == Self::RDWR.0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// File type reported by [`getfileinfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FileType {
    /// Block device.
    Block = 3,
}

// ============================================================================
// Slot Table
// ============================================================================

struct Slot {
    dev: Arc<dyn BlockFront>,
    info: BlkInfo,
    open: u32,
}

static SLOTS: Mutex<[Option<Slot>; NBLKDEV]> = Mutex::new([
    None, None, None, None, None, None, None, None, None, None,
]);

// Mutated only under the bridge mutex; read by the poller outside it.
static OUTSTANDING: [AtomicU32; NBLKDEV] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

pub(crate) fn device(slot: usize) -> Option<Arc<dyn BlockFront>> {
    SLOTS.lock()[slot].as_ref().map(|s| s.dev.clone())
}

/// Requests in flight on `slot`.
pub fn outstanding(slot: usize) -> u32 {
    OUTSTANDING[slot].load(Ordering::SeqCst)
}

pub(crate) fn outstanding_inc(slot: usize) {
    OUTSTANDING[slot].fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn outstanding_dec(slot: usize) {
    OUTSTANDING[slot].fetch_sub(1, Ordering::SeqCst);
}

// ============================================================================
// Device Names
// ============================================================================

/// Parse a device name of the exact form `blk<digit>`.
fn devname2num(name: &str) -> Option<usize> {
    // Block devices only.
    if name.len() != 4 || !name.starts_with("blk") {
        return None;
    }
    let digit = name.as_bytes()[3];
    if digit.is_ascii_digit() {
        let num = (digit - b'0') as usize;
        if num < NBLKDEV {
            return Some(num);
        }
    }
    None
}

fn vbd_number(slot: usize) -> usize {
    768 + (slot << 6)
}

// ============================================================================
// Open / Close
// ============================================================================

fn devopen(num: usize) -> Result<(), Errno> {
    {
        let mut slots = SLOTS.lock();
        if let Some(slot) = slots[num].as_mut() {
            slot.open += 1;
            return Ok(());
        }
    }

    let mut path: heapless::String<32> = heapless::String::new();
    let _ = write!(path, "device/vbd/{}", vbd_number(num));

    // Attaching talks to the hypervisor store and may block.
    let nlocks = hyper::kernel_unsched();
    let dev = front::attach(&path);
    hyper::kernel_sched(nlocks);

    match dev {
        Some(dev) => {
            let info = dev.info();
            SLOTS.lock()[num] = Some(Slot { dev, info, open: 1 });
            Ok(())
        }
        None => Err(Errno::Io),
    }
}

fn devclose(num: usize) {
    let toclose = {
        let mut slots = SLOTS.lock();
        match slots[num].as_mut() {
            Some(slot) => {
                slot.open -= 1;
                if slot.open == 0 {
                    slots[num].take().map(|s| s.dev)
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(dev) = toclose {
        // The slot is already cleared; the client contract guarantees no
        // requests are outstanding here.
        dev.shutdown();
    }
}

/// Open the block device `name` (`blk0`..`blk9`), returning its descriptor.
///
/// The mode must carry [`OpenFlags::BIO`]; write access to read-only media
/// is refused with the open count unchanged.
pub fn open(name: &str, mode: OpenFlags) -> Result<i32, Errno> {
    if !mode.contains(OpenFlags::BIO) {
        return Err(Errno::Nxio);
    }
    let num = devname2num(name).ok_or(Errno::Nxio)?;
    devopen(num)?;

    if mode.wants_write() {
        let read_only = SLOTS.lock()[num]
            .as_ref()
            .map(|s| s.info.read_only)
            .unwrap_or(true);
        if read_only {
            devclose(num);
            return Err(Errno::RoFs);
        }
    }

    Ok(BLKFDOFF + num as i32)
}

/// Close a descriptor. On the last close the slot is cleared and the device
/// shut down.
///
/// The client must not close a descriptor while requests are outstanding on
/// its slot; close does not wait for them to drain.
pub fn close(fd: i32) -> Result<(), Errno> {
    let rfd = fd - BLKFDOFF;
    if rfd < 0 || rfd as usize >= NBLKDEV {
        return Err(Errno::BadF);
    }
    let num = rfd as usize;
    if SLOTS.lock()[num].is_none() {
        return Err(Errno::BadF);
    }
    devclose(num);
    Ok(())
}

/// Report the size in bytes and type of a block device, opening it
/// transiently.
pub fn getfileinfo(name: &str) -> Result<(u64, FileType), Errno> {
    let num = devname2num(name).ok_or(Errno::Nxio)?;
    devopen(num)?;
    let size = SLOTS.lock()[num]
        .as_ref()
        .map(|s| s.info.size_bytes())
        .unwrap_or(0);
    devclose(num);
    Ok((size, FileType::Block))
}
