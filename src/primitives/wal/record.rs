use bytes::Bytes;

use crate::types::{Result, WalError};

use super::PART_HEADER_LEN;

/// A caller-supplied log record, consumed part by part as it is copied into
/// the page buffer.
pub trait LogRecord: Send {
    /// Bytes not yet copied.
    fn bytes_remaining(&self) -> usize;
    /// True until the first byte has been copied.
    fn is_first_part(&self) -> bool;
    /// Copies the next `dst.len()` bytes of the record into `dst` and
    /// returns how many were copied.
    fn copy_into(&mut self, dst: &mut [u8]) -> usize;
}

/// A record over an owned byte payload.
#[derive(Clone, Debug)]
pub struct PayloadRecord {
    data: Bytes,
    position: usize,
}

impl PayloadRecord {
    /// Wraps a payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    /// Full payload regardless of copy progress.
    pub fn payload(&self) -> &Bytes {
        &self.data
    }
}

impl LogRecord for PayloadRecord {
    fn bytes_remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn is_first_part(&self) -> bool {
        self.position == 0
    }

    fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.bytes_remaining());
        dst[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }
}

/// Position of a part within its record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PartKind {
    /// Opens a multi-part record.
    First = 0,
    /// Continues a multi-part record.
    Middle = 1,
    /// Closes a record; single-part records are written as `Last`.
    Last = 2,
    /// Filler that completes a page before it is flushed.
    Padding = 3,
}

impl PartKind {
    /// Decodes the type byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(PartKind::First),
            1 => Ok(PartKind::Middle),
            2 => Ok(PartKind::Last),
            3 => Ok(PartKind::Padding),
            _ => Err(WalError::Corruption("unknown log part type")),
        }
    }
}

/// The four bytes in front of every part: type, multi-part id, and a
/// big-endian payload length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartHeader {
    /// Part type.
    pub kind: PartKind,
    /// Lease correlating the parts of one record; 0 for single-part records.
    pub multi_part_id: u8,
    /// Payload bytes following the header.
    pub len: u16,
}

impl PartHeader {
    /// Header for a data part.
    pub fn for_data(completed: bool, first: bool, multi_part_id: u8, len: usize) -> Self {
        let kind = if completed {
            PartKind::Last
        } else if first {
            PartKind::First
        } else {
            PartKind::Middle
        };
        Self {
            kind,
            multi_part_id,
            len: len as u16,
        }
    }

    /// Encodes the header.
    pub fn encode(&self) -> [u8; PART_HEADER_LEN] {
        let len = self.len.to_be_bytes();
        [self.kind as u8, self.multi_part_id, len[0], len[1]]
    }

    /// Decodes a header.
    pub fn decode(src: [u8; PART_HEADER_LEN]) -> Result<Self> {
        Ok(Self {
            kind: PartKind::from_byte(src[0])?,
            multi_part_id: src[1],
            len: u16::from_be_bytes([src[2], src[3]]),
        })
    }
}
