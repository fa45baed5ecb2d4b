use crate::primitives::io::FileIo;
use crate::types::checksum::{self, CRC_LEN};
use crate::types::{Result, WalError};

use super::{FILE_HEADER_LEN, HEADER_REGION_LEN, PAGE_SIZE};

const LOG_MAGIC: [u8; 4] = *b"RWAL";
const LOG_FORMAT_VERSION: u16 = 1;
const CRC_OFFSET: usize = 36;
const ENCODED_LEN: usize = CRC_OFFSET + CRC_LEN;

/// The redundant header stored twice in page 0 of the log file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLogHeader {
    /// Total file size in bytes, a multiple of the page size.
    pub file_size: u64,
    /// Address of the oldest byte that recovery still needs.
    pub start_byte_address: u64,
    /// Sector marker value the page at the start address was written with.
    pub sector_byte: u8,
    generation: u64,
}

impl FileLogHeader {
    /// Header of a freshly formatted file.
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            start_byte_address: HEADER_REGION_LEN,
            sector_byte: 1,
            generation: 0,
        }
    }

    /// Number of rewrites this header has seen.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pages available for log data.
    pub fn data_pages(&self) -> u64 {
        (self.file_size - HEADER_REGION_LEN) / PAGE_SIZE as u64
    }

    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.file_size.to_be_bytes());
        buf[16..24].copy_from_slice(&self.start_byte_address.to_be_bytes());
        buf[24] = self.sector_byte;
        buf[28..36].copy_from_slice(&self.generation.to_be_bytes());
        checksum::seal(&mut buf, CRC_OFFSET);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < ENCODED_LEN {
            return Err(WalError::Corruption("log header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(WalError::Corruption("log magic mismatch"));
        }
        let version = u16::from_be_bytes([src[4], src[5]]);
        if version != LOG_FORMAT_VERSION {
            return Err(WalError::Corruption("log format version mismatch"));
        }
        checksum::verify(&src[..ENCODED_LEN], CRC_OFFSET)?;
        if src[6..8] != [0, 0] || src[25..28] != [0, 0, 0] {
            return Err(WalError::Corruption("log reserved header bytes non-zero"));
        }
        let header = Self {
            file_size: u64::from_be_bytes(read_array(&src[8..16])),
            start_byte_address: u64::from_be_bytes(read_array(&src[16..24])),
            sector_byte: src[24],
            generation: u64::from_be_bytes(read_array(&src[28..36])),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.file_size % PAGE_SIZE as u64 != 0 || self.file_size < HEADER_REGION_LEN * 2 {
            return Err(WalError::Corruption("log header file size invalid"));
        }
        if self.start_byte_address < HEADER_REGION_LEN || self.start_byte_address >= self.file_size
        {
            return Err(WalError::Corruption("log header start address out of range"));
        }
        if self.sector_byte > 1 {
            return Err(WalError::Corruption("log header sector byte invalid"));
        }
        Ok(())
    }

    /// Reads both copies and returns the newest valid one.
    pub fn read(io: &dyn FileIo) -> Result<Self> {
        let mut region = vec![0u8; HEADER_REGION_LEN as usize];
        io.read_at(0, &mut region)?;
        let first = Self::decode(&region[..FILE_HEADER_LEN]);
        let second = Self::decode(&region[FILE_HEADER_LEN..]);
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.generation > a.generation { b } else { a }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(err), Err(_)) => Err(err),
        }
    }

    /// Bumps the generation and rewrites both copies, syncing after each so
    /// one copy is always intact.
    pub fn write(&mut self, io: &dyn FileIo) -> Result<()> {
        self.generation += 1;
        let encoded = self.encode();
        io.write_at(0, &encoded)?;
        io.sync_all()?;
        io.write_at(FILE_HEADER_LEN as u64, &encoded)?;
        io.sync_all()
    }
}

fn read_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&src[..N]);
    out
}
