use std::io;

use thiserror::Error as ThisError;

/// Failures surfaced by the ring itself. Per-operation failures travel in the
/// `res` field of the completion entry and are never converted into one of
/// these.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The setup syscall failed with the given errno.
    #[error("io_uring_setup failed: errno {0}")]
    Setup(i32),
    /// Mapping one of the ring regions failed with the given errno.
    #[error("mapping ring memory failed: errno {0}")]
    Mmap(i32),
    /// Applying the do-not-fork hint to a ring region failed.
    #[error("madvise on ring memory failed: errno {0}")]
    Madvise(i32),
    /// The enter syscall failed with the given errno.
    #[error("io_uring_enter failed: errno {0}")]
    Enter(i32),
    /// The register syscall failed with the given errno.
    #[error("io_uring_register failed: errno {0}")]
    Register(i32),
    /// No submission entry could be reserved, even after flushing.
    #[error("submission queue full")]
    SqFull,
    /// A timed wait expired before enough completions arrived.
    #[error("timed out waiting for completions")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The raw errno behind this error, if it came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::Setup(e)
            | Error::Mmap(e)
            | Error::Madvise(e)
            | Error::Enter(e)
            | Error::Register(e) => Some(e),
            Error::TimedOut => Some(libc::ETIME),
            Error::SqFull => None,
        }
    }

    /// Whether the underlying syscall was interrupted by a signal. Interrupted
    /// waits are retried internally, so callers normally only see this from
    /// plain submits.
    pub fn is_interrupt(&self) -> bool {
        self.raw_os_error() == Some(libc::EINTR)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}
