#![forbid(unsafe_code)]
//! Error types for wbcache.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno mapping used to complete host block-layer
//! requests.

use thiserror::Error;

/// Unified error type for all wbcache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scratch pool exhausted: {0}")]
    OutOfMemory(&'static str),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("corrupt metadata at sector {sector}: {detail}")]
    Corruption { sector: u64, detail: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device is shutting down")]
    ShuttingDown,
}

impl CacheError {
    /// Convert this error into the errno a block layer would report for the
    /// originating request.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::Format(_) | Self::InvalidConfig(_) => libc::EINVAL,
            Self::ShuttingDown => libc::ESHUTDOWN,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
