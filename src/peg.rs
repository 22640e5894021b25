//! The peg chain.
//!
//! A [`Fat`](crate::fat::Fat) cannot be freed while a skinny handle's word
//! points to it directly, because whoever is dereferencing it holds no
//! reference of their own -- they're trusting the word not to change out
//! from under them. Promoting that trust into an owned reference needs one
//! atomic step, but locating *and* locking the fat is two. A peg bridges
//! the gap: it is published in the fat's place just long enough for its
//! installer to walk past it, lock the fat, and fold the chain back down.
//!
//! Each heap record reachable from a skinny handle carries a common
//! first-byte header so a walker can tell a peg from a fat before it knows
//! which one it has. A peg's `refcount` starts at 2 (one for the skinny
//! handle's pointer at it, one for the installing thread) and is retired in
//! up to two passes: a handle that observes the chain has moved on strips
//! the head's "this is what the skinny cell currently points at" share, and
//! the installing thread later strips its own share and cascades down the
//! `next` pointers it left behind.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::error::SkinnyError;
use crate::fat::Fat;
use crate::sys;

/// First byte shared by every heap record a skinny handle's word can point
/// at, so a walker can distinguish a peg from a fat.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) is_peg: bool,
}

/// A placeholder published while a fat is being located and locked.
#[repr(C)]
pub(crate) struct Peg {
    pub(crate) header: Header,
    pub(crate) refcount: AtomicU8,
    pub(crate) next: *mut Header,
}

/// No thread holds the mutex and no fat has ever been allocated for it.
pub(crate) const UNLOCKED: *mut Header = ptr::null_mut();
/// The mutex is held, but has never been contended enough to need a fat.
pub(crate) const LOCKED: *mut Header = 1usize as *mut Header;

/// `true` for anything other than the two sentinel values, i.e. a real
/// pointer to a peg or a fat.
#[inline]
pub(crate) fn is_allocated(p: *mut Header) -> bool {
    (p as usize) > 1
}

unsafe fn is_peg(p: *mut Header) -> bool {
    debug_assert!(is_allocated(p));
    (*p).is_peg
}

/// Follow `next` links past any pegs until the terminating fat is reached.
unsafe fn find_fat(mut p: *mut Header) -> *mut Fat {
    while is_peg(p) {
        p = (*(p as *mut Peg)).next;
    }
    p as *mut Fat
}

/// Outcome of [`peg_and_lock`].
pub(crate) enum Pegged {
    /// The fat was found and is now locked.
    Locked(*mut Fat),
    /// `skinny`'s word no longer matched `observed_head` by the time the
    /// peg could be installed; the caller should reload and retry.
    Retry,
}

/// Publish a peg in place of `observed_head`, walk through it to the fat,
/// lock the fat, then fold the chain back down to point at the fat
/// directly, freeing every peg made obsolete in the process.
pub(crate) fn peg_and_lock(
    skinny: &AtomicPtr<Header>,
    mut observed_head: *mut Header,
) -> Result<Pegged, SkinnyError> {
    debug_assert!(is_allocated(observed_head));

    let peg = sys::alloc_box(Peg {
        header: Header { is_peg: true },
        refcount: AtomicU8::new(2),
        next: observed_head,
    })?;
    let peg = Box::into_raw(peg);

    loop {
        match skinny.compare_exchange(observed_head, peg as *mut Header, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => {
                if !is_allocated(actual) {
                    // The fat vanished (demoted or never promoted) before we
                    // could pin it down; nothing to walk.
                    drop(unsafe { Box::from_raw(peg) });
                    return Ok(Pegged::Retry);
                }
                observed_head = actual;
                unsafe { (*peg).next = observed_head };
            }
        }
    }

    // Published: nobody can free the chain starting at `peg` out from under
    // us now, so it's safe to walk to the fat and lock it.
    let fat = unsafe { find_fat(peg as *mut Header) };
    unsafe { (*fat).mutex.lock() }?;

    // Demote the primary chain back down to a direct pointer. `p` is
    // whatever the chain looked like the instant before the swap -- it
    // might be our own peg, or a concurrent installer might already have
    // raced ahead of us.
    let p0 = skinny.swap(fat as *mut Header, Ordering::AcqRel);
    unsafe { (*fat).refcount += 1 };

    let mut p = p0;
    let mut decrement: u8;
    loop {
        decrement = 2;
        if p == peg as *mut Header {
            break;
        }
        decrement = 1;
        if p == fat as *mut Header {
            unsafe { (*fat).refcount -= 1 };
            break;
        }
        let stranger = p as *mut Peg;
        let prev = unsafe { (*stranger).refcount.fetch_sub(1, Ordering::AcqRel) };
        if prev == 1 {
            let next = unsafe { (*stranger).next };
            drop(unsafe { Box::from_raw(stranger) });
            p = next;
        } else {
            // A secondary chain still holds a share of this peg; stop.
            break;
        }
    }

    // Retire our own peg using the decrement the walk above settled on,
    // cascading through `next` the same way.
    let mut node = peg;
    loop {
        let prev = unsafe { (*node).refcount.fetch_sub(decrement, Ordering::AcqRel) };
        if prev != decrement {
            break;
        }
        let next = unsafe { (*node).next };
        drop(unsafe { Box::from_raw(node) });
        if next == fat as *mut Header {
            unsafe { (*fat).refcount -= 1 };
            break;
        }
        node = next as *mut Peg;
        decrement = 1;
    }

    Ok(Pegged::Locked(fat))
}

#[cfg(feature = "debug-checks")]
pub(crate) unsafe fn assert_valid_chain(mut p: *mut Header) {
    while is_allocated(p) && is_peg(p) {
        p = (*(p as *mut Peg)).next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_not_allocated() {
        assert!(!is_allocated(UNLOCKED));
        assert!(!is_allocated(LOCKED));
    }

    #[test]
    fn any_other_pointer_is_allocated() {
        let mut x = 0u8;
        let p = &mut x as *mut u8 as *mut Header;
        assert!(is_allocated(p));
    }
}
