//! Status codes and errors for the pwasio umbrella crate.
//!
//! [`AsioError`] is what client calls fail with: a status code plus the
//! message that `GetErrorMessage` later hands out. [`Error`] wraps
//! construction-time failures so `?` propagates across crate boundaries.

use pwasio_core::{BackendError, LifecycleError};
use thiserror::Error;

/// Status code returned by every successful client call.
pub const ASE_OK: i32 = 0;

/// A failed client call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsioError {
    /// A required predecessor (streams, buffers, a running loop) is missing.
    #[error("{0}")]
    NotPresent(String),

    #[error("{0}")]
    HwMalfunction(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    InvalidMode(String),

    #[error("{0}")]
    SpNotAdvancing(String),

    #[error("{0}")]
    NoClock(String),

    #[error("{0}")]
    NoMemory(String),
}

impl AsioError {
    /// Signed status code.
    pub fn code(&self) -> i32 {
        match self {
            AsioError::NotPresent(_) => -1000,
            AsioError::HwMalfunction(_) => -999,
            AsioError::InvalidParameter(_) => -998,
            AsioError::InvalidMode(_) => -997,
            AsioError::SpNotAdvancing(_) => -996,
            AsioError::NoClock(_) => -995,
            AsioError::NoMemory(_) => -994,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AsioError::NotPresent(m)
            | AsioError::HwMalfunction(m)
            | AsioError::InvalidParameter(m)
            | AsioError::InvalidMode(m)
            | AsioError::SpNotAdvancing(m)
            | AsioError::NoClock(m)
            | AsioError::NoMemory(m) => m,
        }
    }
}

/// Result of a client call.
pub type AsioResult<T> = std::result::Result<T, AsioError>;

/// Status code of a client call result.
pub fn status_code<T>(result: &AsioResult<T>) -> i32 {
    match result {
        Ok(_) => ASE_OK,
        Err(e) => e.code(),
    }
}

impl From<LifecycleError> for AsioError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Absent { reason, .. } => AsioError::NotPresent(reason.into()),
            LifecycleError::InvalidMode { reason, .. } => AsioError::InvalidMode(reason.into()),
        }
    }
}

impl From<BackendError> for AsioError {
    fn from(err: BackendError) -> Self {
        let message = err.to_string();
        match err {
            BackendError::CreateStream(_) | BackendError::Connect(..) => {
                AsioError::NoMemory(message)
            }
            BackendError::Format(_) => AsioError::InvalidMode(message),
            BackendError::Start(_) | BackendError::NoThreadUtils => {
                AsioError::HwMalfunction(message)
            }
        }
    }
}

impl From<pwasio_core::Error> for AsioError {
    fn from(err: pwasio_core::Error) -> Self {
        use pwasio_core::Error as Core;

        let message = err.to_string();
        match err {
            Core::InvalidConfig(_) => AsioError::InvalidParameter(message),
            Core::InvalidChannel { .. } | Core::BufferSizeMismatch { .. } => {
                AsioError::InvalidMode(message)
            }
            Core::Arena { .. } => AsioError::NoMemory(message),
            Core::Backend(e) => e.into(),
            Core::Lifecycle(e) => e.into(),
            Core::Thread(_) | Core::Store(_) | Core::Io(_) => AsioError::HwMalfunction(message),
        }
    }
}

/// Construction and setup errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] pwasio_core::Error),

    #[error("Driver: {0}")]
    Asio(#[from] AsioError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
