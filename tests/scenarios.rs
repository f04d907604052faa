//! End-to-end scenarios on the hosted kernel.
//!
//! All tests share one kernel instance (scheduler state is global), so each
//! takes the KERNEL lock, leaves its threads exited and its devices closed.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pvcore::blk::bio::{self, BioOp};
use pvcore::blk::front::{BlockFront, IoPtr, RamDisk};
use pvcore::blk::{self, FileType, OpenFlags, BLKFDOFF};
use pvcore::errno::Errno;
use pvcore::hyper::{self, ClockType, HyperUp};
use pvcore::sched::{self, Thread, ThreadFlags};
use pvcore::types::{millis, NSEC_PER_MSEC, NSEC_PER_SEC};

// ============================================================================
// Shared kernel setup
// ============================================================================

static KERNEL: Mutex<()> = Mutex::new(());

static UNSCHED_CALLS: AtomicUsize = AtomicUsize::new(0);
static NEWLWP_CALLS: AtomicUsize = AtomicUsize::new(0);

fn up_schedule() {}
fn up_unschedule() {}
fn up_backend_unschedule() -> usize {
    UNSCHED_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}
fn up_backend_schedule(_nlocks: usize) {}
fn up_lwproc_newlwp(_pid: u64) -> i32 {
    NEWLWP_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

// Attach hook: RAM disks of 2048 x 512-byte sectors; slot 3 is read-only
// media. Slot 0 carries known content at offset 0.
fn attach(path: &str) -> Option<Arc<dyn BlockFront>> {
    let vbd: usize = path.strip_prefix("device/vbd/")?.parse().ok()?;
    let slot = (vbd - 768) >> 6;
    let disk = RamDisk::new(2048, 512, slot == 3);
    if slot == 0 {
        disk.load(0, b"pvcore scenario data");
    }
    Some(disk)
}

fn setup() -> MutexGuard<'static, ()> {
    let guard = KERNEL.lock().unwrap_or_else(|e| e.into_inner());
    pvcore::init();
    blk::front::set_attach(attach);
    hyper::init(
        hyper::HYPERCALL_VERSION,
        HyperUp {
            schedule: up_schedule,
            unschedule: up_unschedule,
            backend_unschedule: up_backend_unschedule,
            backend_schedule: up_backend_schedule,
            lwproc_newlwp: up_lwproc_newlwp,
        },
    )
    .expect("hypercall version accepted");
    // Let threads released by the previous test finish exiting, so every
    // test starts from a quiescent run queue.
    for _ in 0..8 {
        sched::schedule();
    }
    guard
}

fn now_ns() -> u64 {
    let (sec, nsec) = hyper::clock_gettime(ClockType::AbsMono);
    sec as u64 * NSEC_PER_SEC + nsec
}

// ============================================================================
// Scheduling scenarios
// ============================================================================

static SEQ: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn pingpong_entry(tag: usize) {
    for _ in 0..100 {
        SEQ.lock().unwrap().push(tag as u8);
        sched::schedule();
    }
}

#[test]
fn two_thread_ping_pong() {
    let _k = setup();
    SEQ.lock().unwrap().clear();

    let a = sched::create_thread("ping-a", 0, pingpong_entry, b'a' as usize, None);
    a.set_must_join();
    let b = sched::create_thread("ping-b", 0, pingpong_entry, b'b' as usize, None);
    b.set_must_join();
    sched::join_thread(&a);
    sched::join_thread(&b);

    let seq = SEQ.lock().unwrap().clone();
    assert_eq!(seq.len(), 200);
    assert_eq!(seq.iter().filter(|&&c| c == b'a').count(), 100);
    assert_eq!(seq.iter().filter(|&&c| c == b'b').count(), 100);
    // With only the two of them runnable, round robin alternates strictly.
    for w in seq.windows(2) {
        assert_ne!(w[0], w[1], "a thread ran twice in a row: {:?}", w);
    }
}

#[test]
fn timed_sleep_fires_timer() {
    let _k = setup();
    let t0 = now_ns();
    let timed_out = sched::msleep(50);
    assert!(timed_out);
    assert!(now_ns() - t0 >= millis(50));
}

#[test]
fn zero_sleep_times_out_immediately() {
    let _k = setup();
    assert!(sched::msleep(0));
}

static WAKE_TARGET: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

fn waker_entry(_arg: usize) {
    sched::msleep(10);
    let target = WAKE_TARGET.lock().unwrap().take().expect("target stashed");
    sched::wake(&target);
}

#[test]
fn wake_preempts_timer() {
    let _k = setup();
    *WAKE_TARGET.lock().unwrap() = Some(sched::current_thread());

    let w = sched::create_thread("waker", 0, waker_entry, 0, None);
    w.set_must_join();

    let t0 = now_ns();
    let timed_out = sched::msleep(1000);
    let elapsed = now_ns() - t0;
    assert!(!timed_out, "explicit wake must not read as a timeout");
    assert!(elapsed >= millis(10));
    assert!(elapsed < millis(1000));

    sched::join_thread(&w);
}

static WORK_DONE: AtomicUsize = AtomicUsize::new(0);

fn worker_entry(_arg: usize) {
    WORK_DONE.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn join_releases_exiting_thread() {
    let _k = setup();
    let count0 = sched::global_scheduler().thread_count();
    let done0 = WORK_DONE.load(Ordering::SeqCst);

    let t = sched::create_thread("worker", 0, worker_entry, 0, None);
    t.set_must_join();

    // Let the worker run to its exit gate.
    while !t.has_flag(ThreadFlags::JOINED) {
        sched::schedule();
    }
    assert!(t.has_flag(ThreadFlags::MUSTJOIN));
    assert_eq!(WORK_DONE.load(Ordering::SeqCst), done0 + 1);

    sched::join_thread(&t);
    assert!(!t.has_flag(ThreadFlags::MUSTJOIN));

    // The released thread leaves the run queue on its next turns.
    for _ in 0..4 {
        sched::schedule();
    }
    assert_eq!(sched::global_scheduler().thread_count(), count0);
    assert!(!t.is_runnable());
}

static EXT_RAN: AtomicBool = AtomicBool::new(false);

fn ext_entry(_arg: usize) {
    EXT_RAN.store(true, Ordering::SeqCst);
}

#[test]
fn external_stack_thread() {
    let _k = setup();
    let stack: &'static mut [u8] = Box::leak(vec![0u8; 16 * 1024].into_boxed_slice());
    let extent = (stack.as_mut_ptr() as usize, stack.len());

    let t = sched::create_thread("extstack", 0, ext_entry, 0, Some(extent));
    t.set_must_join();
    assert!(t.has_flag(ThreadFlags::EXTSTACK));
    assert_eq!(t.stack_extent(), extent);

    sched::join_thread(&t);
    assert!(EXT_RAN.load(Ordering::SeqCst));
}

static HOOK_SAW: AtomicUsize = AtomicUsize::new(0);

fn switch_hook(_prev_cookie: usize, next_cookie: usize) {
    if next_cookie != 0 {
        HOOK_SAW.store(next_cookie, Ordering::SeqCst);
    }
}

fn cookie_entry(_arg: usize) {}

#[test]
fn sched_hook_sees_cookies() {
    let _k = setup();
    sched::set_sched_hook(switch_hook);
    let t = sched::create_thread("cookie", 0x7e57, cookie_entry, 0, None);
    t.set_must_join();
    sched::join_thread(&t);
    assert_eq!(HOOK_SAW.load(Ordering::SeqCst), 0x7e57);
}

#[test]
fn idle_thread_latches_started() {
    let _k = setup();
    for _ in 0..4 {
        if sched::threads_started() {
            break;
        }
        sched::schedule();
    }
    assert!(sched::threads_started());
}

#[test]
fn absolute_sleep_reaches_target() {
    let _k = setup();
    let target_ms = now_ns() / NSEC_PER_MSEC + 20;
    assert!(sched::absmsleep(target_ms));
    assert!(now_ns() >= millis(target_ms));
}

#[test]
fn clock_sleep_variants() {
    let _k = setup();

    let t0 = now_ns();
    hyper::clock_sleep(ClockType::RelWall, 0, 5 * NSEC_PER_MSEC);
    assert!(now_ns() - t0 >= millis(5));

    let target = now_ns() + millis(7);
    hyper::clock_sleep(
        ClockType::AbsMono,
        (target / NSEC_PER_SEC) as i64,
        target % NSEC_PER_SEC,
    );
    assert!(now_ns() >= target);
}

// ============================================================================
// Block I/O scenarios
// ============================================================================

static BIO_DONE: AtomicBool = AtomicBool::new(false);
static BIO_NBYTES: AtomicUsize = AtomicUsize::new(0);
static BIO_ERROR: AtomicI32 = AtomicI32::new(-1);
static BIO_ARG: AtomicUsize = AtomicUsize::new(0);

fn bio_done(arg: usize, nbytes: usize, error: i32) {
    BIO_ARG.store(arg, Ordering::SeqCst);
    BIO_NBYTES.store(nbytes, Ordering::SeqCst);
    BIO_ERROR.store(error, Ordering::SeqCst);
    BIO_DONE.store(true, Ordering::SeqCst);
}

fn submit_and_wait(fd: i32, op: BioOp, buf: IoPtr, len: usize, off: i64, arg: usize) {
    BIO_DONE.store(false, Ordering::SeqCst);
    bio::bio(fd, op, buf, len, off, bio_done, arg);
    for _ in 0..64 {
        if BIO_DONE.load(Ordering::SeqCst) {
            break;
        }
        sched::schedule();
    }
    assert!(BIO_DONE.load(Ordering::SeqCst), "completion callback never ran");
}

#[test]
fn block_io_round_trip() {
    let _k = setup();
    let unsched0 = UNSCHED_CALLS.load(Ordering::SeqCst);

    let fd = blk::open("blk0", OpenFlags::BIO | OpenFlags::RDWR).expect("open blk0");
    assert_eq!(fd, BLKFDOFF);

    let mut buf = vec![0u8; 4096];
    submit_and_wait(
        fd,
        BioOp::READ,
        IoPtr::new(buf.as_mut_ptr()),
        4096,
        0,
        0x1234,
    );
    assert_eq!(BIO_ARG.load(Ordering::SeqCst), 0x1234);
    assert_eq!(BIO_NBYTES.load(Ordering::SeqCst), 4096);
    assert_eq!(BIO_ERROR.load(Ordering::SeqCst), 0);
    assert!(buf.starts_with(b"pvcore scenario data"));

    // Quiescent: all counters drained.
    assert_eq!(bio::outstanding_total(), 0);
    assert_eq!(blk::outstanding(0), 0);

    // The submit path released and reacquired the guest kernel locks.
    assert!(UNSCHED_CALLS.load(Ordering::SeqCst) > unsched0);
    // The poller established its own lwp identity.
    assert_eq!(NEWLWP_CALLS.load(Ordering::SeqCst), 1);

    blk::close(fd).expect("close blk0");
}

#[test]
fn block_io_write_then_read_back() {
    let _k = setup();
    let fd = blk::open("blk1", OpenFlags::BIO | OpenFlags::RDWR).expect("open blk1");

    let mut wbuf = vec![0u8; 512];
    wbuf[..11].copy_from_slice(b"hello block");
    submit_and_wait(fd, BioOp::WRITE, IoPtr::new(wbuf.as_mut_ptr()), 512, 1024, 1);
    assert_eq!(BIO_NBYTES.load(Ordering::SeqCst), 512);
    assert_eq!(BIO_ERROR.load(Ordering::SeqCst), 0);

    let mut rbuf = vec![0u8; 512];
    submit_and_wait(fd, BioOp::READ, IoPtr::new(rbuf.as_mut_ptr()), 512, 1024, 2);
    assert_eq!(BIO_ERROR.load(Ordering::SeqCst), 0);
    assert_eq!(&rbuf[..11], b"hello block");

    assert_eq!(bio::outstanding_total(), 0);
    blk::close(fd).expect("close blk1");
}

#[test]
fn transfer_past_end_reports_eio() {
    let _k = setup();
    let fd = blk::open("blk2", OpenFlags::BIO | OpenFlags::RDONLY).expect("open blk2");

    let mut buf = vec![0u8; 4096];
    let size = 2048 * 512;
    submit_and_wait(
        fd,
        BioOp::READ,
        IoPtr::new(buf.as_mut_ptr()),
        4096,
        size - 512,
        3,
    );
    assert_eq!(BIO_NBYTES.load(Ordering::SeqCst), 0);
    assert_eq!(BIO_ERROR.load(Ordering::SeqCst), Errno::Io.code());
    assert_eq!(bio::outstanding_total(), 0);

    blk::close(fd).expect("close blk2");
}

#[test]
fn read_only_enforcement() {
    let _k = setup();
    assert_eq!(
        blk::open("blk3", OpenFlags::BIO | OpenFlags::RDWR),
        Err(Errno::RoFs)
    );
    assert_eq!(
        blk::open("blk3", OpenFlags::BIO | OpenFlags::WRONLY),
        Err(Errno::RoFs)
    );

    // The refused open left no reference behind: a read-only open works and
    // its close tears the slot down completely.
    let fd = blk::open("blk3", OpenFlags::BIO | OpenFlags::RDONLY).expect("read-only open");
    assert_eq!(fd, BLKFDOFF + 3);
    blk::close(fd).expect("close blk3");
    assert_eq!(blk::close(fd), Err(Errno::BadF));
}

#[test]
fn getfileinfo_reports_size_and_type() {
    let _k = setup();
    let (size, ty) = blk::getfileinfo("blk4").expect("getfileinfo");
    assert_eq!(size, 2048 * 512);
    assert_eq!(ty, FileType::Block);
    // The transient open was closed again.
    assert_eq!(blk::close(BLKFDOFF + 4), Err(Errno::BadF));

    assert_eq!(blk::getfileinfo("blkx"), Err(Errno::Nxio));
}

#[test]
fn open_refcounts_nest() {
    let _k = setup();
    let fd1 = blk::open("blk5", OpenFlags::BIO | OpenFlags::RDONLY).expect("first open");
    let fd2 = blk::open("blk5", OpenFlags::BIO | OpenFlags::RDONLY).expect("second open");
    assert_eq!(fd1, fd2);
    blk::close(fd1).expect("first close");
    // Still open once.
    blk::close(fd2).expect("second close");
    assert_eq!(blk::close(fd1), Err(Errno::BadF));
}
