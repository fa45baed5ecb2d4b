//! Per-sector marker bits.
//!
//! The last bit of every 512-byte sector in a page is overwritten with the
//! marker value of the current cycle. The bits it displaced are collected
//! into byte 0 of the page (sector `k` lands in bit `k`), which is why a page
//! carries only 4095 bytes of log data.

use super::{PAGE_SIZE, SECTOR_SIZE};

/// Number of sectors in one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Collects the low bit of each sector's last byte into byte 0 and stamps
/// `marker` in its place.
pub fn set_sector_bits(page: &mut [u8], marker: u8) {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let marker = marker & 1;
    let mut collected = 0u8;
    for sector in 0..SECTORS_PER_PAGE {
        let last = (sector + 1) * SECTOR_SIZE - 1;
        collected |= (page[last] & 1) << sector;
        page[last] = (page[last] & !1) | marker;
    }
    page[0] = collected;
}

/// Returns true when every sector of the page carries `marker`.
pub fn sector_bits_match(page: &[u8], marker: u8) -> bool {
    let marker = marker & 1;
    (0..SECTORS_PER_PAGE).all(|sector| page[(sector + 1) * SECTOR_SIZE - 1] & 1 == marker)
}

/// Puts the bits collected in byte 0 back into their sectors.
pub fn restore_sector_bits(page: &mut [u8]) {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let collected = page[0];
    for sector in 0..SECTORS_PER_PAGE {
        let last = (sector + 1) * SECTOR_SIZE - 1;
        page[last] = (page[last] & !1) | ((collected >> sector) & 1);
    }
}

/// The other marker value.
pub fn flip(marker: u8) -> u8 {
    (marker & 1) ^ 1
}

/// Zeroed pages stamped with `marker`, used to format new file regions.
pub fn formatted_pages(pages: usize, marker: u8) -> Vec<u8> {
    let mut out = vec![0u8; pages * PAGE_SIZE];
    for page in out.chunks_exact_mut(PAGE_SIZE) {
        set_sector_bits(page, marker);
    }
    out
}
