//! The fat record: the heavyweight state a skinny handle promotes to the
//! first time it needs to block a thread or track waiters.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::SkinnyError;
use crate::peg::{self, Header, Pegged};
use crate::sys::{self, RawCondVar, RawMutex};

/// The heavyweight mutex state. `held`, `waiters`, `refcount`,
/// `transfer_gen`, and `transfers` are only ever touched while `mutex` is
/// locked.
#[repr(C)]
pub(crate) struct Fat {
    pub(crate) header: Header,
    pub(crate) mutex: RawMutex,
    pub(crate) cond: RawCondVar,
    pub(crate) held: bool,
    pub(crate) waiters: i64,
    /// Offset by one: the primary chain (the skinny handle's own word)
    /// contributes 0, not 1, so a lone held-uncontended fat with no other
    /// referents reads 0 as well as `refcount == 0` when unheld.
    pub(crate) refcount: i64,
    pub(crate) transfer_gen: u64,
    pub(crate) transfers: i64,
}

/// Allocate a fat for a handle currently encoding `head` (either
/// [`peg::UNLOCKED`] or [`peg::LOCKED`]), lock it, and try to install it
/// directly. Returns `Ok(None)` if a concurrent operation got there first,
/// in which case the caller should reload and retry.
pub(crate) fn promote(skinny: &AtomicPtr<Header>, head: *mut Header) -> Result<Option<*mut Fat>, SkinnyError> {
    debug_assert!(!peg::is_allocated(head));
    let held = head == peg::LOCKED;

    let mutex = RawMutex::new()?;
    let cond = match RawCondVar::new() {
        Ok(cond) => cond,
        Err(e) => {
            mutex.destroy()?;
            return Err(e);
        }
    };

    let fat = sys::alloc_box(Fat {
        header: Header { is_peg: false },
        mutex,
        cond,
        held,
        waiters: 0,
        refcount: if held { 1 } else { 0 },
        transfer_gen: 0,
        transfers: 0,
    })?;
    let fat = Box::into_raw(fat);

    unsafe { (*fat).mutex.lock() }?;

    match skinny.compare_exchange(head, fat as *mut Header, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            log::trace!("promoted skinny handle to fat {fat:p}");
            Ok(Some(fat))
        }
        Err(_) => {
            // Lost the race to install; this is a retry signal, not a real
            // error, so the fat is freed and `Ok(None)` returned regardless
            // of how this cleanup goes -- mirroring the original, which
            // unlocks and frees unconditionally here.
            let fat = unsafe { Box::from_raw(fat) };
            let fat_ptr: *const Fat = &*fat;
            let unlock_res = fat.mutex.unlock();
            let destroy_res = crate::error::recover_with(fat.mutex.destroy(), fat.cond.destroy());
            if let Err(e) = crate::error::recover_with(unlock_res, destroy_res) {
                log::warn!("failed to tear down fat {fat_ptr:p} after a lost promotion race: {e}");
            }
            Ok(None)
        }
    }
}

/// Resolve `head` to a locked fat, dispatching to promotion or the peg
/// protocol depending on whether `head` already names an allocation.
pub(crate) fn get_fat(skinny: &AtomicPtr<Header>, head: *mut Header) -> Result<Option<*mut Fat>, SkinnyError> {
    if peg::is_allocated(head) {
        match peg::peg_and_lock(skinny, head)? {
            Pegged::Locked(fat) => Ok(Some(fat)),
            Pegged::Retry => Ok(None),
        }
    } else {
        promote(skinny, head)
    }
}

/// Give up a reference to a locked `fat`. Frees it and demotes the skinny
/// handle back to unlocked if this was the last reference and nothing else
/// has since re-pegged it.
pub(crate) fn release(skinny: &AtomicPtr<Header>, fat: *mut Fat) -> Result<(), SkinnyError> {
    unsafe { (*fat).refcount -= 1 };
    let still_referenced = unsafe { (*fat).refcount != 0 };
    let demoted = !still_referenced
        && skinny
            .compare_exchange(fat as *mut Header, peg::UNLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

    let unlock_res = unsafe { (*fat).mutex.unlock() };
    if !demoted {
        return unlock_res;
    }
    unlock_res?;

    log::trace!("demoted skinny handle, freeing fat {fat:p}");
    let fat = unsafe { Box::from_raw(fat) };
    fat.cond.destroy()?;
    fat.mutex.destroy()?;
    Ok(())
}

/// Wait for `fat.held` to clear and claim it, given `fat.mutex` already
/// locked and the caller's wait already reflected in `fat.refcount`.
///
/// On a wait error, the fat is released (mirroring the cleanup the original
/// registers for cancellation) and the error is returned.
pub(crate) fn fat_lock(skinny: &AtomicPtr<Header>, fat: *mut Fat) -> Result<(), SkinnyError> {
    while unsafe { (*fat).held } {
        unsafe { (*fat).waiters += 1 };
        let wait_res = {
            let _guard = sys::CancelGuard::defer();
            unsafe { (*fat).cond.wait(&(*fat).mutex) }
        };
        unsafe { (*fat).waiters -= 1 };
        if let Err(e) = wait_res {
            let release_res = release(skinny, fat);
            return crate::error::recover_with(Err(e), release_res);
        }
    }
    unsafe { (*fat).held = true };
    unsafe { (*fat).mutex.unlock() }
}

/// Resolve `skinny` to its locked fat, requiring that the mutex currently
/// be held. Returns [`SkinnyError::NotOwner`] if it is not, after unlocking
/// the fat it had to allocate to find that out.
pub(crate) fn get_held(skinny: &AtomicPtr<Header>) -> Result<*mut Fat, SkinnyError> {
    loop {
        let head = skinny.load(Ordering::Acquire);
        if head == peg::UNLOCKED {
            return Err(SkinnyError::NotOwner);
        }
        if let Some(fat) = get_fat(skinny, head)? {
            if unsafe { (*fat).held } {
                return Ok(fat);
            }
            unsafe { (*fat).mutex.unlock() }?;
            return Err(SkinnyError::NotOwner);
        }
    }
}
