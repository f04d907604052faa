//! Architecture adapter seam.
//!
//! Register save/restore and the actual transfer of control are supplied by
//! a port, not by this crate. The `hosted` implementation backs every guest
//! thread with a parked host thread and hands a single run token between
//! them, which preserves the one-runs-at-a-time cooperative model exactly.

use crate::mem::PAGE_SIZE;

/// Default guest stack size.
pub const STACK_SIZE: usize = 16 * PAGE_SIZE;

/// Thread entry point.
pub type ThreadEntry = fn(usize);

#[cfg(feature = "hosted")]
mod hosted;
#[cfg(feature = "hosted")]
pub use hosted::{launch, switch, ThreadMd};

#[cfg(not(feature = "hosted"))]
mod stub;
#[cfg(not(feature = "hosted"))]
pub use stub::{launch, switch, ThreadMd};
