//! Core types shared by the log engine: the error enum and checksum helpers.

#![forbid(unsafe_code)]

use std::sync::Arc;

/// CRC32 sealing for the on-disk header.
pub mod checksum;

/// Errors raised by the log writer and its helpers.
#[derive(thiserror::Error, Debug)]
pub enum WalError {
    /// Permanent I/O failure on the log file.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The space accountant could not satisfy a reservation.
    #[error("log full: requested {requested} bytes, {available} available")]
    LogFull {
        /// Bytes asked for.
        requested: i64,
        /// Bytes that were unreserved at the time of the request.
        available: i64,
    },
    /// A resize was refused because live data would not fit the new size.
    #[error("log file size {requested} too small: occupancy {occupancy:.3} exceeds {threshold:.3}")]
    FileSizeTooSmall {
        /// Requested file size in bytes.
        requested: u64,
        /// Occupancy the log would have at the requested size.
        occupancy: f32,
        /// Highest occupancy a resize may produce.
        threshold: f32,
    },
    /// A helper thread has stopped.
    #[error("{0} is not running")]
    ThreadNotRunning(&'static str),
    /// A helper thread died; carries the failure that killed it.
    #[error("{thread} terminated abnormally: {cause}")]
    Terminated {
        /// Name of the helper that failed.
        thread: &'static str,
        /// The error it failed with.
        #[source]
        cause: Arc<WalError>,
    },
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Internal failure that cannot be retried.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl WalError {
    /// Returns true for failures a caller may recover from locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WalError::LogFull { .. } | WalError::FileSizeTooSmall { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WalError>;
