// vim: tw=80
//! Common type definitions used throughout pario

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
};
use thiserror::Error;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// pario's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive,
         Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Bad file descriptor")]
    EBADF           = libc::EBADF as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Bad address")]
    EFAULT          = libc::EFAULT as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("File too large")]
    EFBIG           = libc::EFBIG as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Result too large")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Function not implemented")]
    ENOSYS          = libc::ENOSYS as isize,
    #[error("Operation timed out")]
    ETIMEDOUT       = libc::ETIMEDOUT as isize,
    #[error("Stale NFS file handle")]
    ESTALE          = libc::ESTALE as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,
    #[error("Protocol error")]
    EPROTO          = libc::EPROTO as isize,

    //// pario custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
    /// The storage target runs with a different pool version than the one the
    /// request was built with.
    #[error("Pool version mismatch")]
    EVERMISMATCH    = 257,
}

impl Error {
    /// Does this reply code only mean that our cached pool state is stale?
    pub fn is_stale(self) -> bool {
        self == Error::EVERMISMATCH
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            // Neither of these has an errno equivalent
            Error::EUNKNOWN | Error::EVERMISMATCH => libc::EIO,
            _ => e as i32
        }
    }
}

pub type Result<T = ()> = ::std::result::Result<T, Error>;

/// Direction of an I/O operation
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IoDir {
    Read,
    Write
}

impl Display for IoDir {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            IoDir::Read => f.write_str("read"),
            IoDir::Write => f.write_str("write"),
        }
    }
}

/// File identifier.
///
/// Names a striped file within the cluster.  The storage targets store one
/// component object per file per device.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Fid {
    pub container: u64,
    pub key: u64
}

impl Fid {
    pub const fn new(container: u64, key: u64) -> Self {
        Fid{container, key}
    }
}

impl Display for Fid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "<{:x}:{:x}>", self.container, self.key)
    }
}

/// Identifies one component object: the part of a file stored on one device.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TargetId {
    pub fid: Fid,
    pub dev: u32
}

impl TargetId {
    pub const fn new(fid: Fid, dev: u32) -> Self {
        TargetId{fid, dev}
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.fid, self.dev)
    }
}

// LCOV_EXCL_STOP
