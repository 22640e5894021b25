//! The public handle: one atomic word that only grows a heap allocation the
//! first time it is contended.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::SkinnyError;
use crate::fat;
use crate::peg::{self, Header, Pegged};

/// A mutex that costs one machine word until two threads actually disagree
/// about who holds it.
///
/// `SkinnyMutex::new` never allocates. The first contended `lock` promotes
/// the handle to a heap-allocated record with a real blocking mutex and
/// condition variable behind it; the record is freed again once nothing
/// references it, so an uncontended mutex stays a single word indefinitely.
pub struct SkinnyMutex {
    pub(crate) val: AtomicPtr<Header>,
}

unsafe impl Send for SkinnyMutex {}
unsafe impl Sync for SkinnyMutex {}

impl SkinnyMutex {
    /// Create a new, unlocked mutex. Never allocates.
    pub fn new() -> Self {
        SkinnyMutex { val: AtomicPtr::new(peg::UNLOCKED) }
    }

    /// Check that the mutex is safe to tear down: unlocked, with no live
    /// fat record. Returns [`SkinnyError::Busy`] otherwise.
    ///
    /// Actual teardown happens on `Drop`; this only validates the
    /// precondition, mirroring `pthread_mutex_destroy`'s contract that
    /// destroying a held mutex is a programming error rather than
    /// something the type itself can prevent.
    pub fn destroy(&self) -> Result<(), SkinnyError> {
        if self.val.load(Ordering::Acquire) != peg::UNLOCKED {
            return Err(SkinnyError::Busy);
        }
        Ok(())
    }

    /// Acquire the mutex, blocking the calling thread if necessary.
    pub fn lock(&self) -> Result<(), SkinnyError> {
        if self
            .val
            .compare_exchange(peg::UNLOCKED, peg::LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
        self.lock_slow()
    }

    fn lock_slow(&self) -> Result<(), SkinnyError> {
        loop {
            let head = self.val.load(Ordering::Acquire);
            if head == peg::UNLOCKED {
                if self
                    .val
                    .compare_exchange(head, peg::LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if let Some(fat) = fat::get_fat(&self.val, head)? {
                unsafe { (*fat).refcount += 1 };
                return fat::fat_lock(&self.val, fat);
            }
        }
    }

    /// Acquire the mutex without blocking.
    ///
    /// Returns [`SkinnyError::Busy`] rather than blocking if it is already
    /// held, including by another thread mid-`transfer`.
    pub fn try_lock(&self) -> Result<(), SkinnyError> {
        loop {
            let head = self.val.load(Ordering::Acquire);
            if head == peg::UNLOCKED {
                if self
                    .val
                    .compare_exchange(head, peg::LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if head == peg::LOCKED {
                return Err(SkinnyError::Busy);
            }
            match peg::peg_and_lock(&self.val, head)? {
                Pegged::Retry => continue,
                Pegged::Locked(fat) => {
                    if unsafe { (*fat).held } {
                        unsafe { (*fat).mutex.unlock() }?;
                        return Err(SkinnyError::Busy);
                    }
                    unsafe { (*fat).held = true };
                    // Order doesn't matter here (both are only observed
                    // under `fat.mutex`, which we still hold), but we bump
                    // the reference before dropping it for symmetry with
                    // `lock_slow`.
                    unsafe { (*fat).refcount += 1 };
                    unsafe { (*fat).mutex.unlock() }?;
                    return Ok(());
                }
            }
        }
    }

    /// Release the mutex. Returns [`SkinnyError::NotOwner`] if the calling
    /// thread does not hold it.
    pub fn unlock(&self) -> Result<(), SkinnyError> {
        if self
            .val
            .compare_exchange(peg::LOCKED, peg::UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
        self.unlock_slow()
    }

    pub(crate) fn unlock_slow(&self) -> Result<(), SkinnyError> {
        let fat = fat::get_held(&self.val)?;
        unsafe { (*fat).held = false };
        let signal_res = if unsafe { (*fat).waiters > 0 } {
            unsafe { (*fat).cond.signal() }
        } else {
            Ok(())
        };
        let release_res = fat::release(&self.val, fat);
        crate::error::recover(signal_res, release_res)
    }
}

impl Default for SkinnyMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkinnyMutex {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.val.load(Ordering::Acquire),
            peg::UNLOCKED,
            "SkinnyMutex dropped while still locked or holding a fat record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_mutex_is_unlocked() {
        let m = SkinnyMutex::new();
        assert_eq!(m.val.load(Ordering::Relaxed), peg::UNLOCKED);
    }

    #[test]
    fn lock_unlock_roundtrip_stays_skinny() {
        let m = SkinnyMutex::new();
        m.lock().unwrap();
        assert_eq!(m.val.load(Ordering::Relaxed), peg::LOCKED);
        m.unlock().unwrap();
        assert_eq!(m.val.load(Ordering::Relaxed), peg::UNLOCKED);
    }

    #[test]
    fn try_lock_succeeds_once() {
        let m = SkinnyMutex::new();
        m.try_lock().unwrap();
        assert!(matches!(m.try_lock(), Err(SkinnyError::Busy)));
        m.unlock().unwrap();
    }

    #[test]
    fn unlock_without_holding_is_not_owner() {
        let m = SkinnyMutex::new();
        assert!(matches!(m.unlock(), Err(SkinnyError::NotOwner)));
    }

    #[test]
    fn destroy_while_locked_is_busy() {
        let m = SkinnyMutex::new();
        m.lock().unwrap();
        let err = m.destroy().unwrap_err();
        assert!(matches!(err, SkinnyError::Busy));
        m.unlock().unwrap();
    }
}
