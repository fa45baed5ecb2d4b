//! Reads a log file back in log order.
//!
//! The scan starts at the header's start address and accepts pages while
//! their sector markers carry the expected value, flipping the expectation
//! whenever it passes the end of the file. The first page with the wrong
//! marker ends the log.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::primitives::io::FileIo;
use crate::types::{Result, WalError};

use super::header::FileLogHeader;
use super::record::{PartHeader, PartKind};
use super::{sector, ResumePoint, HEADER_REGION_LEN, PAGE_SIZE, PART_HEADER_LEN};

/// One complete record found by a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedRecord {
    /// File address of the record's first part header.
    pub address: u64,
    /// Multi-part id the record was written under; 0 for single parts.
    pub multi_part_id: u8,
    /// Reassembled payload.
    pub payload: Bytes,
}

/// Result of walking a log file.
#[derive(Clone, Debug, Default)]
pub struct LogScan {
    /// Records in the order their last part appears in the log.
    pub records: Vec<ScannedRecord>,
    /// File page index just past the last valid page.
    pub next_page: u64,
    /// Pages whose markers matched.
    pub pages_read: u64,
    /// Padding parts and raw padding runs skipped.
    pub padding_parts: u64,
    /// Parts of records whose other parts were not found.
    pub orphan_parts: u64,
    /// True when the walk passed the end of the file.
    pub cycled: bool,
}

impl LogScan {
    /// Where a writer reopened on this file continues, given the sequence
    /// number of the last page recovery accounted for.
    pub fn resume_point(&self, last_sequence: u64) -> ResumePoint {
        ResumePoint {
            last_sequence,
            next_page: self.next_page,
        }
    }
}

/// Reader over a closed, or crashed, log file.
pub struct LogScanner {
    io: Arc<dyn FileIo>,
    header: FileLogHeader,
}

impl LogScanner {
    /// Reads and validates the file header.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let header = FileLogHeader::read(io.as_ref())?;
        Ok(Self { io, header })
    }

    /// Header the scan starts from.
    pub fn header(&self) -> &FileLogHeader {
        &self.header
    }

    /// Walks the log from its start address.
    pub fn scan(&self) -> Result<LogScan> {
        let mut scan = LogScan::default();
        let mut stream = PageStream::new(self.io.as_ref(), &self.header);
        let first_offset = ((self.header.start_byte_address % PAGE_SIZE as u64) as usize).max(1);
        let mut pending: HashMap<u8, (u64, Vec<u8>)> = HashMap::new();

        if stream.load()? {
            stream.offset = first_offset;
            loop {
                if stream.offset == PAGE_SIZE && !stream.load()? {
                    break;
                }
                let address = stream.address();
                if stream.page[stream.offset] == PartKind::Padding as u8
                    && stream.remaining() < PART_HEADER_LEN
                {
                    stream.offset = PAGE_SIZE;
                    scan.padding_parts += 1;
                    continue;
                }
                let mut raw = [0u8; PART_HEADER_LEN];
                if !stream.read_exact(&mut raw)? {
                    break;
                }
                let part = PartHeader::decode(raw)?;
                let len = part.len as usize;
                if part.kind == PartKind::Padding {
                    if len > stream.remaining() {
                        return Err(WalError::Corruption("padding part crosses a page"));
                    }
                    stream.offset += len;
                    scan.padding_parts += 1;
                    continue;
                }
                let mut payload = vec![0u8; len];
                if !stream.read_exact(&mut payload)? {
                    // The rest of this part never reached the disk.
                    scan.orphan_parts += 1;
                    break;
                }
                match (part.kind, part.multi_part_id) {
                    (PartKind::Last, 0) => scan.records.push(ScannedRecord {
                        address,
                        multi_part_id: 0,
                        payload: Bytes::from(payload),
                    }),
                    (_, 0) => {
                        return Err(WalError::Corruption("multi-part fragment without an id"));
                    }
                    (PartKind::First, id) => {
                        if pending.insert(id, (address, payload)).is_some() {
                            scan.orphan_parts += 1;
                        }
                    }
                    (PartKind::Middle, id) => match pending.get_mut(&id) {
                        Some((_, collected)) => collected.extend_from_slice(&payload),
                        None => scan.orphan_parts += 1,
                    },
                    (PartKind::Last, id) => match pending.remove(&id) {
                        Some((first_address, mut collected)) => {
                            collected.extend_from_slice(&payload);
                            scan.records.push(ScannedRecord {
                                address: first_address,
                                multi_part_id: id,
                                payload: Bytes::from(collected),
                            });
                        }
                        None => scan.orphan_parts += 1,
                    },
                    (PartKind::Padding, _) => unreachable!("padding handled above"),
                }
            }
        }

        scan.orphan_parts += pending.len() as u64;
        scan.next_page = stream.next_address / PAGE_SIZE as u64;
        scan.pages_read = stream.pages_read;
        scan.cycled = stream.cycled;
        Ok(scan)
    }
}

/// Byte stream over consecutive valid pages, sector bytes skipped.
struct PageStream<'a> {
    io: &'a dyn FileIo,
    file_size: u64,
    pages_left: u64,
    page: Vec<u8>,
    page_address: u64,
    next_address: u64,
    marker: u8,
    offset: usize,
    pages_read: u64,
    cycled: bool,
}

impl<'a> PageStream<'a> {
    fn new(io: &'a dyn FileIo, header: &FileLogHeader) -> Self {
        let start = header.start_byte_address;
        Self {
            io,
            file_size: header.file_size,
            pages_left: header.data_pages(),
            page: vec![0u8; PAGE_SIZE],
            page_address: 0,
            next_address: start - start % PAGE_SIZE as u64,
            marker: header.sector_byte,
            offset: PAGE_SIZE,
            pages_read: 0,
            cycled: false,
        }
    }

    /// Loads the next page if its markers say it belongs to this log.
    fn load(&mut self) -> Result<bool> {
        if self.pages_left == 0 {
            return Ok(false);
        }
        self.io.read_at(self.next_address, &mut self.page)?;
        if !sector::sector_bits_match(&self.page, self.marker) {
            return Ok(false);
        }
        sector::restore_sector_bits(&mut self.page);
        self.pages_left -= 1;
        self.pages_read += 1;
        self.page_address = self.next_address;
        self.next_address += PAGE_SIZE as u64;
        if self.next_address >= self.file_size {
            self.next_address = HEADER_REGION_LEN;
            self.marker = sector::flip(self.marker);
            self.cycled = true;
        }
        self.offset = 1;
        Ok(true)
    }

    fn address(&self) -> u64 {
        self.page_address + self.offset as u64
    }

    fn remaining(&self) -> usize {
        PAGE_SIZE - self.offset
    }

    /// Fills `dst`, crossing into following pages. False if the log ended
    /// first.
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.offset == PAGE_SIZE && !self.load()? {
                return Ok(false);
            }
            let n = (dst.len() - filled).min(self.remaining());
            dst[filled..filled + n].copy_from_slice(&self.page[self.offset..self.offset + n]);
            self.offset += n;
            filled += n;
        }
        Ok(true)
    }
}
