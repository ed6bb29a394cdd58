use std::io;

use kdbus_wire::WireError;
use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("kernel call failed: {0}")]
    Os(#[from] io::Error),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("pool buffer was already released")]
    StalePoolRef,

    #[error("delivery queue is full")]
    QueueFull,

    #[error("message is sealed")]
    Sealed,

    #[error("message is not sealed")]
    NotSealed,

    #[error("cannot read argument of type {found:?} as a basic value")]
    Type { found: Option<char> },

    #[error("invalid connection configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl BusError {
    pub fn os(errno: i32) -> Self {
        BusError::Os(io::Error::from_raw_os_error(errno))
    }

    /// Negative errno equivalent, as the kernel interface reports failures.
    pub fn errno(&self) -> i32 {
        let code = match self {
            BusError::Os(err) => err.raw_os_error().unwrap_or(libc::EIO),
            BusError::OutOfMemory(_) => libc::ENOMEM,
            BusError::Malformed(_) | BusError::Wire(_) => libc::EBADMSG,
            BusError::Unsupported(_) => libc::EOPNOTSUPP,
            BusError::StalePoolRef => libc::ESTALE,
            BusError::QueueFull => libc::ENOBUFS,
            BusError::Sealed | BusError::NotSealed => libc::EPERM,
            BusError::Type { .. } => libc::ENXIO,
            BusError::InvalidConfig(_) => libc::EINVAL,
        };
        -code
    }

    /// Raw OS error number carried by an [`BusError::Os`] error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            BusError::Os(err) => err.raw_os_error(),
            _ => None,
        }
    }
}
