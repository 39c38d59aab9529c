//! Error taxonomy for ownership transitions
//!
//! Every recoverable failure maps onto a Linux errno so that the hypercall
//! surface can hand a signed status code straight back to the caller.
//! Invariant violations are not represented here: they panic.

use thiserror::Error;

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const E2BIG: i64 = 7;
pub const EAGAIN: i64 = 11;
pub const ENOMEM: i64 = 12;
pub const EFAULT: i64 = 14;
pub const EBUSY: i64 = 16;
pub const EINVAL: i64 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A participant is not in the state the transition requires.
    #[error("page state mismatch")]
    Perm,
    /// Bad alignment, wrong region kind, out-of-range owner id.
    #[error("invalid argument")]
    Inval,
    /// Page-table pool exhausted.
    #[error("page-table pool exhausted")]
    NoMem,
    /// A concurrent walk found a valid entry; retry the whole operation.
    #[error("raced with a concurrent mapping, retry")]
    Again,
    /// The hypervisor still holds a reference to the page.
    #[error("page is pinned")]
    Busy,
    /// More pages requested than the protocol supports.
    #[error("too many pages")]
    TooBig,
    /// The initiator does not map the page at all.
    #[error("address not mapped")]
    Fault,
    /// No valid translation where one was expected.
    #[error("no such entry")]
    NoEnt,
}

impl Error {
    /// Negative errno, as returned to the host in x1.
    pub const fn to_errno(self) -> i64 {
        -(match self {
            Error::Perm => EPERM,
            Error::Inval => EINVAL,
            Error::NoMem => ENOMEM,
            Error::Again => EAGAIN,
            Error::Busy => EBUSY,
            Error::TooBig => E2BIG,
            Error::Fault => EFAULT,
            Error::NoEnt => ENOENT,
        })
    }

    /// Inverse of [`Error::to_errno`]. Accepts either sign.
    pub fn from_errno(errno: i64) -> Option<Self> {
        Some(match errno.abs() {
            EPERM => Error::Perm,
            EINVAL => Error::Inval,
            ENOMEM => Error::NoMem,
            EAGAIN => Error::Again,
            EBUSY => Error::Busy,
            E2BIG => Error::TooBig,
            EFAULT => Error::Fault,
            ENOENT => Error::NoEnt,
            _ => return None,
        })
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Collapse a result into the signed status code of the hypercall ABI.
pub fn status<T>(res: Result<T>) -> i64 {
    match res {
        Ok(_) => 0,
        Err(e) => e.to_errno(),
    }
}
