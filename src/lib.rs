//! A mutex that costs one word until it's contended.
//!
//! [`SkinnyMutex`] starts life as a single `usize`-sized atomic: unlocked is
//! zero, locked-with-no-contention is one. The first time a second thread
//! actually blocks on it, the handle promotes itself to a heap-allocated
//! record with a real OS mutex and condition variable behind it, and
//! demotes back to the single word once nothing references that record
//! any more. Programs with many rarely-contended locks (one per object,
//! say) pay for the heavyweight machinery only where it's needed.
//!
//! Reclaiming the heavyweight record safely, without a hazard-pointer
//! registry or an epoch-based GC running alongside it, is the interesting
//! part of this crate; see the internal `peg` module for how.
//!
//! ```
//! use skinny_mutex::SkinnyMutex;
//!
//! let m = SkinnyMutex::new();
//! m.lock().unwrap();
//! m.unlock().unwrap();
//! ```
//!
//! # Errors
//!
//! Every operation here can fail: allocation can fail while promoting, and
//! the underlying host mutex/condvar primitives can in principle return an
//! error status. [`SkinnyError`] represents both, alongside the mutex's own
//! `Busy`/`NotOwner`/`Again` conditions. See [`sys`] for the host boundary
//! these errors cross.

mod condvar;
mod error;
mod fat;
mod peg;
mod skinny;
mod sys;
mod transfer;

pub use condvar::CondVar;
pub use error::{HostError, SkinnyError};
pub use skinny::SkinnyMutex;
pub use transfer::{transfer, veto_transfer};
