//! Error types for pwasio-core.

use crate::lifecycle::LifecycleError;
use crate::ports::Direction;
use thiserror::Error;

/// Stage of arena creation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStage {
    Descriptor,
    Truncate,
    Map,
    Seal,
}

impl std::fmt::Display for ArenaStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaStage::Descriptor => write!(f, "create buffer file descriptor"),
            ArenaStage::Truncate => write!(f, "truncate buffer file"),
            ArenaStage::Map => write!(f, "mmap buffer"),
            ArenaStage::Seal => write!(f, "seal buffer file"),
        }
    }
}

/// Error type for pwasio-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid channel requested {direction} {index}")]
    InvalidChannel { direction: Direction, index: i32 },

    #[error("Invalid buffer size {requested} (configured {configured})")]
    BufferSizeMismatch { requested: i32, configured: usize },

    #[error("Failed to {stage}: {source}")]
    Arena {
        stage: ArenaStage,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Config store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a backend collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("failed to create {0} stream")]
    CreateStream(Direction),

    #[error("failed to connect {0} stream: {1}")]
    Connect(Direction, String),

    #[error("failed to start processing loop: {0}")]
    Start(String),

    #[error("unsupported format: {0}")]
    Format(String),

    #[error("no thread utils registered")]
    NoThreadUtils,
}

/// Errors from the realtime thread adapter.
#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("thread '{0}' exited before reporting its id")]
    NoThreadId(String),

    #[error("thread '{0}' panicked")]
    Panicked(String),

    #[error("host priority call failed for thread {tid}: {source}")]
    Priority {
        tid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("realtime privileges unavailable: {0}")]
    Privileges(#[source] std::io::Error),
}
