use thiserror::Error;

#[derive(Error, Debug)]
pub enum PdaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kernel adapter version {driver} is incompatible with library version {library}")]
    ProtocolMismatch { driver: String, library: String },
}

impl PdaError {
    /// POSIX errno equivalent of this error, for callers that want plain return codes.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::InsufficientMemory(_) => libc::ENOMEM,
            Self::Busy(_) => libc::EBUSY,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::ProtocolMismatch { .. } => libc::ENOSYS,
        }
    }

    /// Captures `errno` right after a failed libc call. The raw OS code is kept so
    /// that `code()` still reports it.
    pub(crate) fn last_os_error(what: &str) -> Self {
        let err = std::io::Error::last_os_error();
        log::debug!("{what} failed: {err}");
        Self::Io(err)
    }
}

// A convenient alias
pub type PdaResult<T> = Result<T, PdaError>;
