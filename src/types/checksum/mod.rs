#![forbid(unsafe_code)]

use crate::types::{Result, WalError};

/// Width of a stored checksum.
pub const CRC_LEN: usize = 4;

/// Writes the CRC32 (IEEE) of `buf[..at]` big-endian into `buf[at..at + 4]`.
pub fn seal(buf: &mut [u8], at: usize) {
    let crc = crc32fast::hash(&buf[..at]);
    buf[at..at + CRC_LEN].copy_from_slice(&crc.to_be_bytes());
}

/// Checks a checksum written by [`seal`].
pub fn verify(buf: &[u8], at: usize) -> Result<()> {
    let stored = buf
        .get(at..at + CRC_LEN)
        .ok_or(WalError::Corruption("log header truncated"))?;
    if crc32fast::hash(&buf[..at]).to_be_bytes() != stored {
        return Err(WalError::Corruption("log header crc mismatch"));
    }
    Ok(())
}
