//! Integration with a caller-owned condition variable.
//!
//! `cond_wait`/`cond_timedwait` let a thread that already holds a
//! [`SkinnyMutex`] wait on a condition variable it supplies itself, the same
//! way `pthread_cond_wait(cond, mutex)` takes an arbitrary mutex. The
//! skinny mutex's *logical* hold is released before the wait (another
//! thread may acquire it while we're asleep) and always re-claimed before
//! this function returns, success or error.

use std::sync::atomic::AtomicPtr;
use std::time::Duration;

use crate::error::{recover_with, SkinnyError};
use crate::fat::{self, Fat};
use crate::peg::Header;
use crate::skinny::SkinnyMutex;
use crate::sys::RawCondVar;

/// A condition variable a thread can wait on while holding a
/// [`SkinnyMutex`], independent of any particular mutex instance.
pub struct CondVar(RawCondVar);

impl CondVar {
    /// Create a new, unassociated condition variable.
    pub fn new() -> Result<Self, SkinnyError> {
        Ok(CondVar(RawCondVar::new()?))
    }

    /// Wake one thread blocked in [`SkinnyMutex::cond_wait`] on this
    /// condition variable.
    pub fn notify_one(&self) -> Result<(), SkinnyError> {
        self.0.signal()
    }

    /// Wake every thread blocked in [`SkinnyMutex::cond_wait`] on this
    /// condition variable.
    pub fn notify_all(&self) -> Result<(), SkinnyError> {
        self.0.broadcast()
    }
}

/// Re-acquire `fat`'s logical hold no matter how the wait above returned,
/// including on an unwind through it. The normal path disarms this and
/// performs the equivalent re-acquire itself so it can report the result;
/// the guard only fires on a panic, where there is no result to report.
struct ReacquireOnUnwind<'a> {
    armed: bool,
    skinny: &'a AtomicPtr<Header>,
    fat: *mut Fat,
}

impl<'a> Drop for ReacquireOnUnwind<'a> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fat::fat_lock(self.skinny, self.fat) {
                log::error!("failed to re-acquire skinny mutex while unwinding: {e}");
            }
        }
    }
}

impl SkinnyMutex {
    /// Atomically release this mutex and block on `cond`, re-acquiring the
    /// mutex before returning. The calling thread must already hold it.
    pub fn cond_wait(&self, cond: &CondVar) -> Result<(), SkinnyError> {
        self.cond_wait_inner(cond, None).map(|_| ())
    }

    /// Same as [`cond_wait`](Self::cond_wait), but gives up after
    /// `timeout`. Returns `Ok(true)` if woken, `Ok(false)` on timeout.
    pub fn cond_timedwait(&self, cond: &CondVar, timeout: Duration) -> Result<bool, SkinnyError> {
        self.cond_wait_inner(cond, Some(timeout))
    }

    fn cond_wait_inner(&self, cond: &CondVar, timeout: Option<Duration>) -> Result<bool, SkinnyError> {
        let fat = fat::get_held(&self.val)?;

        if unsafe { (*fat).waiters > 0 } {
            unsafe { (*fat).cond.signal() }?;
        }
        unsafe { (*fat).held = false };

        let mut guard = ReacquireOnUnwind { armed: true, skinny: &self.val, fat };

        let wait_res: Result<bool, SkinnyError> = match timeout {
            None => unsafe { cond.0.wait(&(*fat).mutex) }.map(|()| true),
            Some(d) => unsafe { cond.0.wait_timeout(&(*fat).mutex, d) },
        };

        guard.armed = false;
        let reacquire_res = fat::fat_lock(&self.val, fat);

        match wait_res {
            Ok(woke) => reacquire_res.map(|()| woke),
            Err(e) => recover_with(Err(e), reacquire_res),
        }
    }
}
