//! Lock transfer: atomically releasing one mutex while acquiring another,
//! with a veto escape hatch for a third party to abort a pending transfer.

use std::sync::atomic::Ordering;

use crate::error::{recover_with, SkinnyError};
use crate::fat;
use crate::peg::{self, Pegged};
use crate::skinny::SkinnyMutex;
use crate::sys;

/// Atomically release `a` and acquire `b`, blocking if `b` is already held.
/// The calling thread must hold `a`.
///
/// If a concurrent [`veto_transfer`] on `b` fires while this call is
/// waiting, the transfer is abandoned: `a` is re-acquired and
/// [`SkinnyError::Again`] is returned, leaving both mutexes as if `transfer`
/// had never been called.
///
/// A veto racing the fast path below (`b` unheld and uncontended) is not
/// observed: there is nothing pending to veto yet, so the transfer
/// completes. This mirrors the original's own fast path and is intentional,
/// not an oversight.
pub fn transfer(a: &SkinnyMutex, b: &SkinnyMutex) -> Result<(), SkinnyError> {
    let (fat_b, transfer_gen) = loop {
        let b_head = b.val.load(Ordering::Acquire);
        if b_head == peg::UNLOCKED {
            if b
                .val
                .compare_exchange(b_head, peg::LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return match a.unlock() {
                    Ok(()) => Ok(()),
                    Err(e) => recover_with(Err(e), b.unlock()),
                };
            }
            continue;
        }
        if let Some(fat_b) = fat::get_fat(&b.val, b_head)? {
            let gen = unsafe { (*fat_b).transfer_gen };
            break (fat_b, gen);
        }
    };

    unsafe { (*fat_b).refcount += 1 };

    // We're about to potentially block on fat_b's condvar, which would
    // deadlock if we also held a's fat mutex locked (were a contended).
    // Drop fat_b's lock around the slow unlock of a to avoid that.
    if a
        .val
        .compare_exchange(peg::LOCKED, peg::UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        // Mirrors the original, which does not check these two particular
        // calls' return values either.
        let _ = unsafe { (*fat_b).mutex.unlock() };
        let unlock_res = a.unlock_slow();
        let _ = unsafe { (*fat_b).mutex.lock() };
        if let Err(e) = unlock_res {
            return recover_with(Err(e), fat::release(&b.val, fat_b));
        }
    }

    unsafe { (*fat_b).transfers += 1 };
    unsafe { (*fat_b).waiters += 1 };

    let result: Result<(), SkinnyError> = loop {
        if !unsafe { (*fat_b).held } {
            break Ok(());
        }
        if unsafe { (*fat_b).transfer_gen } != transfer_gen {
            break Err(SkinnyError::Again);
        }
        let _guard = sys::CancelGuard::defer();
        if let Err(e) = unsafe { (*fat_b).cond.wait(&(*fat_b).mutex) } {
            break Err(e);
        }
    };

    unsafe { (*fat_b).transfers -= 1 };
    unsafe { (*fat_b).waiters -= 1 };

    match result {
        Ok(()) => {
            unsafe { (*fat_b).held = true };
            unsafe { (*fat_b).mutex.unlock() }?;
            Ok(())
        }
        Err(e) => {
            let release_res = fat::release(&b.val, fat_b);
            let composed = recover_with(Err(e), release_res);
            recover_with(composed, a.lock())
        }
    }
}

/// Abort any `transfer` currently pending against `skinny`, forcing it to
/// return [`SkinnyError::Again`]. The calling thread must hold `skinny`.
///
/// If no fat has ever been allocated for `skinny` (it is held but never
/// contended), there is nothing to veto and this is a no-op.
pub fn veto_transfer(skinny: &SkinnyMutex) -> Result<(), SkinnyError> {
    loop {
        let head = skinny.val.load(Ordering::Acquire);
        if head == peg::LOCKED {
            return Ok(());
        }
        if head == peg::UNLOCKED {
            return Err(SkinnyError::NotOwner);
        }
        match peg::peg_and_lock(&skinny.val, head)? {
            Pegged::Retry => continue,
            Pegged::Locked(fat) => {
                let mut res: Result<(), SkinnyError> = Err(SkinnyError::NotOwner);
                if unsafe { (*fat).held } {
                    unsafe { (*fat).transfer_gen += 1 };
                    res = Ok(());
                    if unsafe { (*fat).transfers > 0 } {
                        log::debug!("veto_transfer bumped generation with pending transfer(s)");
                        res = unsafe { (*fat).cond.broadcast() };
                    }
                }
                let unlock_res = unsafe { (*fat).mutex.unlock() };
                return recover_with(res, unlock_res);
            }
        }
    }
}
