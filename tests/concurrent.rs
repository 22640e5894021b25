//! Multithreaded integration tests (concrete scenarios 2-6).
//!
//! A counting allocator tracks how many heap blocks are currently live so
//! the handoff test can confirm a contended mutex really does demote back
//! to a single word and free its peg/fat records, not merely report one.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use skinny_mutex::{transfer, veto_transfer, CondVar, SkinnyError, SkinnyMutex};

struct CountingAlloc;

static LIVE_ALLOCATIONS: AtomicI64 = AtomicI64::new(0);

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

#[test]
fn fresh_lock_unlock_stays_skinny() {
    let m = SkinnyMutex::new();
    m.lock().unwrap();
    m.unlock().unwrap();
    m.destroy().unwrap();
}

#[test]
fn contended_handoff_demotes_back_to_skinny() {
    let baseline = LIVE_ALLOCATIONS.load(Ordering::Relaxed);

    let m = SkinnyMutex::new();
    let barrier = Barrier::new(2);
    m.lock().unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            barrier.wait();
            m.lock().unwrap();
            m.unlock().unwrap();
        });

        barrier.wait();
        // Let the other thread actually promote and block before we
        // release; otherwise we might win the fast-path CAS back.
        thread::sleep(Duration::from_millis(20));
        m.unlock().unwrap();

        blocked.join().unwrap();
    });

    m.destroy().unwrap();
    assert_eq!(LIVE_ALLOCATIONS.load(Ordering::Relaxed), baseline);
}

#[test]
fn many_threads_increment_under_lock() {
    const THREADS: usize = 16;
    const ITERS: u64 = 2_000;

    let m = SkinnyMutex::new();
    let counter = AtomicU64::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITERS {
                    m.lock().unwrap();
                    counter.fetch_add(1, Ordering::Relaxed);
                    m.unlock().unwrap();
                }
            });
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ITERS);
    m.destroy().unwrap();
}

#[test]
fn try_lock_does_not_block_on_a_held_mutex() {
    let m = SkinnyMutex::new();
    m.lock().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            assert!(matches!(m.try_lock(), Err(SkinnyError::Busy)));
        })
        .join()
        .unwrap();
    });

    m.unlock().unwrap();
}

#[test]
fn unlock_by_non_owner_is_rejected() {
    let m = SkinnyMutex::new();
    assert!(matches!(m.unlock(), Err(SkinnyError::NotOwner)));
}

#[test]
fn cond_wait_releases_the_logical_hold_while_blocked() {
    let m = SkinnyMutex::new();
    let cond = CondVar::new().unwrap();
    let barrier = Barrier::new(2);
    let woke = AtomicU64::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            m.lock().unwrap();
            barrier.wait();
            m.cond_wait(&cond).unwrap();
            woke.store(1, Ordering::Release);
            m.unlock().unwrap();
        });

        barrier.wait();
        // If cond_wait failed to release the mutex's logical hold, this
        // would block forever.
        m.lock().unwrap();
        cond.notify_one().unwrap();
        m.unlock().unwrap();

        while woke.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
    });
}

#[test]
fn cond_timedwait_reports_timeout() {
    let m = SkinnyMutex::new();
    let cond = CondVar::new().unwrap();

    m.lock().unwrap();
    let woke = m.cond_timedwait(&cond, Duration::from_millis(20)).unwrap();
    m.unlock().unwrap();

    assert!(!woke);
}

#[test]
fn transfer_hands_off_without_unlocking_in_between() {
    let a = SkinnyMutex::new();
    let b = SkinnyMutex::new();

    a.lock().unwrap();
    b.lock().unwrap();
    b.unlock().unwrap();

    transfer(&a, &b).unwrap();

    assert!(matches!(a.try_lock(), Ok(())));
    a.unlock().unwrap();
    b.unlock().unwrap();
}

#[test]
fn transfer_blocks_until_the_target_is_free_then_succeeds() {
    let a = SkinnyMutex::new();
    let b = SkinnyMutex::new();
    let barrier = Barrier::new(2);

    a.lock().unwrap();
    b.lock().unwrap();

    thread::scope(|s| {
        let transferred = s.spawn(|| {
            barrier.wait();
            transfer(&a, &b).unwrap();
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        b.unlock().unwrap();

        transferred.join().unwrap();
    });

    b.unlock().unwrap();
}

#[test]
fn veto_transfer_forces_a_pending_transfer_to_return_again() {
    let a = SkinnyMutex::new();
    let b = SkinnyMutex::new();
    let barrier = Barrier::new(2);

    a.lock().unwrap();
    b.lock().unwrap();

    thread::scope(|s| {
        let outcome = s.spawn(|| {
            barrier.wait();
            transfer(&a, &b)
        });

        barrier.wait();
        // No library hook exists to observe "the transfer has registered
        // itself as a waiter on b"; this sleep is the closest
        // approximation the algorithm's public surface admits.
        thread::sleep(Duration::from_millis(20));
        veto_transfer(&b).unwrap();
        b.unlock().unwrap();

        let result = outcome.join().unwrap();
        assert!(matches!(result, Err(SkinnyError::Again)));
    });

    assert!(matches!(a.try_lock(), Err(SkinnyError::Busy)));
    a.unlock().unwrap();
}

#[test]
fn veto_transfer_on_an_idle_mutex_is_a_harmless_no_op() {
    let a = SkinnyMutex::new();
    a.lock().unwrap();
    veto_transfer(&a).unwrap();
    a.unlock().unwrap();
}
