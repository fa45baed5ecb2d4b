//! Building blocks of the log writer.

/// Positional file I/O.
///
/// The `FileIo` trait the log writes through, and its `std::fs` implementation.
pub mod io;

/// The circular write-ahead log.
///
/// Page buffer, space accounting, the producer path, both helper threads and
/// the recovery-side scanner.
pub mod wal;
