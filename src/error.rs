//! Error types returned by this crate's operations.

use thiserror::Error;

/// Everything that can go wrong using a [`SkinnyMutex`](crate::SkinnyMutex).
#[derive(Debug, Error)]
pub enum SkinnyError {
    /// A heap allocation failed while promoting or pegging the mutex.
    #[error("allocation failed")]
    OutOfMemory,
    /// A host mutex/condvar primitive returned a nonzero status.
    #[error(transparent)]
    Host(#[from] HostError),
    /// `try_lock` found the mutex already held.
    #[error("mutex is already locked")]
    Busy,
    /// `unlock`, `cond_wait`, or `veto_transfer` was called by a thread that
    /// does not currently hold the mutex.
    #[error("calling thread does not hold the mutex")]
    NotOwner,
    /// A pending `transfer` was vetoed by a concurrent `veto_transfer` before
    /// it could complete.
    #[error("transfer was vetoed")]
    Again,
}

/// Wraps a nonzero return code from a `libc` pthread primitive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("host primitive failed with status {0}")]
pub struct HostError(pub(crate) libc::c_int);

/// Combine the outcomes of an operation and the cleanup it triggered.
///
/// If the cleanup failed while the operation also failed, both errors are
/// unrecoverable: there is no sane value left to return, so this logs both
/// and aborts the process rather than silently dropping one of them.
pub(crate) fn recover_with<T>(
    primary: Result<T, SkinnyError>,
    secondary: Result<(), SkinnyError>,
) -> Result<T, SkinnyError> {
    match (primary, secondary) {
        (Ok(v), Ok(())) => Ok(v),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Err(e1), Err(e2)) => {
            log::error!("double fault: {e2} while recovering from {e1}");
            std::process::abort();
        }
    }
}

pub(crate) fn recover(
    primary: Result<(), SkinnyError>,
    secondary: Result<(), SkinnyError>,
) -> Result<(), SkinnyError> {
    recover_with(primary, secondary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_prefers_primary_error() {
        let res = recover(Err(SkinnyError::Busy), Ok(()));
        assert!(matches!(res, Err(SkinnyError::Busy)));
    }

    #[test]
    fn recover_surfaces_secondary_error_on_primary_success() {
        let res = recover(Ok(()), Err(SkinnyError::NotOwner));
        assert!(matches!(res, Err(SkinnyError::NotOwner)));
    }
}
