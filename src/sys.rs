//! Host-primitives boundary.
//!
//! The algorithm in this crate treats blocking mutexes, condition
//! variables, and allocation as external collaborators with a fixed
//! contract (see the crate-level docs), and never names a concrete OS
//! facility outside this module. Everything here is a thin wrapper around
//! `libc`'s pthreads bindings, chosen because the algorithm locks a mutex
//! in one function and unlocks it in another -- a shape `std::sync::Mutex`,
//! whose guard owns the unlock, cannot express.

use std::cell::UnsafeCell;
use std::time::Duration;

use crate::error::{HostError, SkinnyError};

/// A non-recursive blocking mutex, locked and unlocked independently of any
/// particular call's stack frame.
pub(crate) struct RawMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub(crate) fn new() -> Result<Self, SkinnyError> {
        let mut raw = unsafe { std::mem::zeroed::<libc::pthread_mutex_t>() };
        let rc = unsafe { libc::pthread_mutex_init(&mut raw, std::ptr::null()) };
        if rc != 0 {
            return Err(SkinnyError::Host(HostError(rc)));
        }
        Ok(RawMutex { raw: UnsafeCell::new(raw) })
    }

    #[inline]
    pub(crate) fn as_raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    pub(crate) fn lock(&self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    pub(crate) fn unlock(&self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    pub(crate) fn destroy(self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_mutex_destroy(self.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    /// Non-blocking lock attempt. Not on the core's hot paths -- a skinny
    /// handle's own try-lock resolves contention by inspecting `held`
    /// rather than racing the host mutex -- but kept for host-contract
    /// parity with `pthread_mutex_trylock`.
    #[allow(dead_code)]
    pub(crate) fn try_lock(&self) -> Result<bool, SkinnyError> {
        let rc = unsafe { libc::pthread_mutex_trylock(self.as_raw()) };
        match rc {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            other => Err(SkinnyError::Host(HostError(other))),
        }
    }
}

/// A condition variable whose `wait` takes the mutex to atomically drop
/// and re-acquire, mirroring `pthread_cond_wait`/`pthread_cond_timedwait`.
pub(crate) struct RawCondVar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for RawCondVar {}
unsafe impl Sync for RawCondVar {}

impl RawCondVar {
    pub(crate) fn new() -> Result<Self, SkinnyError> {
        let mut raw = unsafe { std::mem::zeroed::<libc::pthread_cond_t>() };
        let rc = unsafe { libc::pthread_cond_init(&mut raw, std::ptr::null()) };
        if rc != 0 {
            return Err(SkinnyError::Host(HostError(rc)));
        }
        Ok(RawCondVar { raw: UnsafeCell::new(raw) })
    }

    /// Atomically unlock `mutex`, block until signalled, then re-lock it.
    pub(crate) fn wait(&self, mutex: &RawMutex) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), mutex.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    /// Same as [`wait`](Self::wait), but gives up after `timeout`. Returns
    /// `Ok(true)` if woken by a signal, `Ok(false)` on timeout.
    pub(crate) fn wait_timeout(&self, mutex: &RawMutex, timeout: Duration) -> Result<bool, SkinnyError> {
        let mut now = unsafe { std::mem::zeroed::<libc::timespec>() };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(SkinnyError::Host(HostError(unsafe { *libc::__errno_location() })));
        }

        let mut deadline = now;
        deadline.tv_sec = deadline.tv_sec.saturating_add(timeout.as_secs() as libc::time_t);
        deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_nsec -= 1_000_000_000;
            deadline.tv_sec = deadline.tv_sec.saturating_add(1);
        }

        let rc = unsafe { libc::pthread_cond_timedwait(self.raw.get(), mutex.as_raw(), &deadline) };
        match rc {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            other => Err(SkinnyError::Host(HostError(other))),
        }
    }

    pub(crate) fn signal(&self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_cond_signal(self.raw.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    pub(crate) fn broadcast(&self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }

    pub(crate) fn destroy(self) -> Result<(), SkinnyError> {
        let rc = unsafe { libc::pthread_cond_destroy(self.raw.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(SkinnyError::Host(HostError(rc)))
        }
    }
}

/// Stand-in for "defer asynchronous cancellation for the duration of a
/// host wait, restore on scope exit".
///
/// Rust threads have no asynchronous external cancellation to defer in the
/// first place (unlike the `pthread_cancel` target this crate's algorithm
/// was translated from, see `cond_wait_cleanup` in the original C), so this
/// guard is a no-op. Its shape is kept as the seam a host that does support
/// such cancellation would plug `pthread_setcancelstate` into.
#[must_use]
pub(crate) struct CancelGuard(());

impl CancelGuard {
    #[inline]
    pub(crate) fn defer() -> Self {
        CancelGuard(())
    }
}

/// Fallible heap allocation. Stable Rust has no fallible `Box::new`, so this
/// goes around the allocator directly and turns a null result into
/// [`SkinnyError::OutOfMemory`] instead of aborting.
pub(crate) fn alloc_box<T>(val: T) -> Result<Box<T>, SkinnyError> {
    use std::alloc::{alloc, Layout};

    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(val));
    }

    unsafe {
        let ptr = alloc(layout) as *mut T;
        if ptr.is_null() {
            return Err(SkinnyError::OutOfMemory);
        }
        ptr.write(val);
        Ok(Box::from_raw(ptr))
    }
}
