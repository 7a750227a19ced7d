use crate::gpu::ProcessorId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HmmError {
    #[error("Invalid address: 0x{0:x}")]
    InvalidAddress(u64),

    #[error("Object not found")]
    NotFound,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Resource busy")]
    Busy,

    #[error("More processing required")]
    MoreProcessingRequired,

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Processor {0} is not registered with this address space")]
    InvalidDevice(ProcessorId),
}

impl HmmError {
    /// The negative errno a host fault path reports for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let errno = match self {
            Self::InvalidAddress(_) => libc::EFAULT,
            Self::NotFound => libc::ENOENT,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Busy => libc::EBUSY,
            Self::MoreProcessingRequired => libc::EAGAIN,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::InvalidDevice(_) => libc::ENODEV,
        };
        -errno
    }

    /// True for the "retry the whole call" signal.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::MoreProcessingRequired)
    }
}

/// Returned when a block's change counter moved while its lock was dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("VA block changed while unlocked")]
pub struct Stale;

impl From<Stale> for HmmError {
    fn from(_: Stale) -> Self {
        Self::MoreProcessingRequired
    }
}

// A convenient alias
pub type HmmResult<T> = Result<T, HmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(HmmError::OutOfMemory.errno(), -libc::ENOMEM);
        assert_eq!(HmmError::MoreProcessingRequired.errno(), -libc::EAGAIN);
        assert_eq!(HmmError::InvalidAddress(0x1000).errno(), -libc::EFAULT);
    }

    #[test]
    fn stale_converts_to_retry() {
        let err: HmmError = Stale.into();
        assert!(err.is_retry());
    }
}
