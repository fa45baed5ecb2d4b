//! ringwal: a circular, page-buffered write-ahead log writer.
//!
//! The log lives in a fixed-size file that is reused cyclically. Producers
//! append records concurrently through [`LogWriter`]; a flush helper thread
//! writes completed pages in sequential batches and a notify helper wakes
//! producers waiting for durability.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::wal::{
    CheckpointAuthority, LogOptions, LogRecord, LogScanner, LogWriter, NoopAuthority,
    PayloadRecord, ResumePoint,
};
pub use types::{Result, WalError};
