use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use rand::Rng;
use skinny_mutex::{transfer, veto_transfer, CondVar, SkinnyMutex};

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

const DUP: usize = 4;
const THREADS: u32 = 8;
const COUNT: u64 = 10_000;
const TRANSFER_ROUNDS: u64 = 2_000;

fn _main() {
    for _dup in 0..DUP {
        let baseline = LIVE_ALLOCATIONS.load(Ordering::Relaxed);

        let mutex = SkinnyMutex::new();
        let counter = AtomicU64::new(0);

        thread::scope(|s| {
            for _t in 0..THREADS {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    for _i in 0..COUNT {
                        if rng.gen_bool(0.05) {
                            match mutex.try_lock() {
                                Ok(()) => {
                                    counter.fetch_add(1, Ordering::Relaxed);
                                    mutex.unlock().unwrap();
                                }
                                Err(_) => {
                                    mutex.lock().unwrap();
                                    counter.fetch_add(1, Ordering::Relaxed);
                                    mutex.unlock().unwrap();
                                }
                            }
                        } else {
                            mutex.lock().unwrap();
                            counter.fetch_add(1, Ordering::Relaxed);
                            mutex.unlock().unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), COUNT * THREADS as u64);
        mutex.destroy().unwrap();

        let live = LIVE_ALLOCATIONS.load(Ordering::Relaxed);
        assert_eq!(live, baseline, "dup {_dup} leaked peg/fat allocations: {live} vs baseline {baseline}");
    }

    stress_cond_wait();
    stress_transfer();
}

fn stress_cond_wait() {
    let mutex = SkinnyMutex::new();
    let cond = CondVar::new().unwrap();
    let ready = AtomicU64::new(0);
    let woken = AtomicU64::new(0);

    mutex.lock().unwrap();
    mutex.unlock().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            mutex.lock().unwrap();
            ready.store(1, Ordering::Release);
            mutex.cond_wait(&cond).unwrap();
            woken.store(1, Ordering::Release);
            mutex.unlock().unwrap();
        });

        while ready.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        // the waiter released its logical hold for the wait; this would
        // deadlock otherwise.
        mutex.lock().unwrap();
        cond.notify_one().unwrap();
        mutex.unlock().unwrap();

        while woken.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
    });

    // a timed wait that nobody ever notifies must report a timeout rather
    // than hang.
    mutex.lock().unwrap();
    assert_eq!(mutex.cond_timedwait(&cond, Duration::from_millis(10)).unwrap(), false);
    mutex.unlock().unwrap();

    mutex.destroy().unwrap();
}

fn stress_transfer() {
    let a = SkinnyMutex::new();
    let b = SkinnyMutex::new();
    let done = AtomicU64::new(0);
    a.lock().unwrap();

    thread::scope(|s| {
        // Ping-pongs ownership between a and b, occasionally losing the
        // race to a veto and having to fall back to a plain unlock/lock.
        s.spawn(|| {
            for _ in 0..TRANSFER_ROUNDS {
                match transfer(&a, &b) {
                    Ok(()) => match transfer(&b, &a) {
                        Ok(()) => {}
                        Err(_) => a.lock().unwrap(),
                    },
                    Err(_) => {
                        a.unlock().unwrap();
                        a.lock().unwrap();
                    }
                }
            }
            done.store(1, Ordering::Release);
        });

        // Races to veto b's incoming transfer; most attempts find nothing
        // pending and are harmless no-ops.
        s.spawn(|| {
            let mut rng = rand::thread_rng();
            while done.load(Ordering::Acquire) == 0 {
                b.lock().unwrap();
                let _ = veto_transfer(&b);
                b.unlock().unwrap();
                if rng.gen_bool(0.1) {
                    thread::sleep(Duration::from_micros(rng.gen_range(1..50)));
                } else {
                    thread::yield_now();
                }
            }
        });
    });

    a.unlock().unwrap();
}

fn main() {
    env_logger::init();
    loop {
        _main();
    }
}
