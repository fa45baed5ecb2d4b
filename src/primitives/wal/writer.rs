//! Producer side of the log: space reservation, byte-range reservation under
//! the buffer lock, copying outside it, and publishing finished pages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::primitives::io::FileIo;
use crate::types::{Result, WalError};

use super::authority::CheckpointAuthority;
use super::buffer::{BufferState, Cursors, LogBuffer, MultiPartStart, PageWriter};
use super::header::FileLogHeader;
use super::lifecycle::{FailureState, HelperControl};
use super::multipart::MultiPartIds;
use super::options::LogOptions;
use super::record::{LogRecord, PartHeader};
use super::space::SpaceAccountant;
use super::stats::{LogStatistics, Stage};
use super::{sector, HEADER_REGION_LEN, PAGE_SIZE, PART_HEADER_LEN};

/// A resize waiting for the flush helper.
#[derive(Debug, Default)]
pub(crate) struct ResizeRequest {
    pub(crate) pending: Option<u64>,
    pub(crate) error: Option<WalError>,
    /// Passes that found the live region in the way and deferred.
    pub(crate) deferred: u64,
}

/// State shared by producers and both helper threads.
pub(crate) struct LogShared {
    pub(crate) io: Arc<dyn FileIo>,
    pub(crate) options: LogOptions,
    pub(crate) authority: Arc<dyn CheckpointAuthority>,
    pub(crate) header: Mutex<FileLogHeader>,
    pub(crate) buffer: Mutex<BufferState>,
    pub(crate) cursors: Cursors,
    pub(crate) space: SpaceAccountant,
    pub(crate) multi_part_ids: MultiPartIds,
    /// Held across a whole mark-setting append, and while a truncate is
    /// requested, so the mark cannot move under the flush helper.
    pub(crate) mark_lock: Mutex<()>,
    pub(crate) truncate_requested: AtomicBool,
    pub(crate) resize: Mutex<ResizeRequest>,
    /// Serialises callers of `set_file_size`.
    pub(crate) resize_lock: Mutex<()>,
    /// Forces one flush pass even when no page is pending.
    pub(crate) flush_kick: AtomicBool,
    pub(crate) pass_lock: Mutex<()>,
    /// Notified at the end of every flush pass.
    pub(crate) pass_done: Condvar,
    /// Next file address the flush helper will write.
    pub(crate) file_position: AtomicU64,
    pub(crate) occupancy_high: AtomicBool,
    pub(crate) flush_helper: HelperControl,
    pub(crate) notify_helper: HelperControl,
    pub(crate) failure: FailureState,
    pub(crate) stats: LogStatistics,
    pub(crate) max_part_len: usize,
}

enum Fill {
    BufferFull,
    Partial,
    Complete(u64),
}

struct Reservation {
    start_buffer: Arc<LogBuffer>,
    end_buffer: Arc<LogBuffer>,
    start_page: usize,
    end_page: usize,
    reserved_address: usize,
    sequence: Option<u64>,
}

/// Distance of `address` past the log start, following the circle.
pub(crate) fn offset_from_start(address: u64, start: u64, file_size: u64) -> u64 {
    if address >= start {
        address - start
    } else {
        address + (file_size - HEADER_REGION_LEN) - start
    }
}

/// True when pages `start..=end` would reach the page before the last
/// notified one, which is kept free to tell a full ring from an empty one.
fn overwrites_unnotified(start: usize, end: usize, next_to_last_notified: usize) -> bool {
    (start < next_to_last_notified && (end < start || end >= next_to_last_notified))
        || (start > next_to_last_notified && end < start && end >= next_to_last_notified)
}

/// File address and marker of a byte offset in the current buffer.
fn file_address(state: &BufferState, offset: usize, file_size: u64) -> (u64, u8) {
    let address = state.buffer_file_position + offset as u64;
    if address >= file_size {
        (
            address - file_size + HEADER_REGION_LEN,
            sector::flip(state.buffer_sector_byte),
        )
    } else {
        (address, state.buffer_sector_byte)
    }
}

impl LogShared {
    pub(crate) fn current_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.buffer.lock().current)
    }

    /// Appends one record. Returns the sequence number of the page holding
    /// its last byte.
    pub(crate) fn add_log_record(
        &self,
        record: &mut dyn LogRecord,
        reserved_delta: i64,
        set_mark: bool,
        check_space: bool,
        flush: bool,
    ) -> Result<u64> {
        self.failure.check()?;
        let total = record.bytes_remaining();
        let parts = total.div_ceil(self.max_part_len).max(1);
        let new_space = reserved_delta + (total + parts * PART_HEADER_LEN) as i64;
        if check_space && new_space > 0 {
            self.space.reserve(new_space)?;
        }

        let lease = if total > self.max_part_len {
            Some(self.multi_part_ids.lease(&self.failure, &self.stats)?)
        } else {
            None
        };
        let multi_part_id = lease.as_ref().map_or(0, |lease| lease.id());

        let sequence = loop {
            match self.try_fill(record, multi_part_id, set_mark, check_space, flush)? {
                Fill::BufferFull => self.flush()?,
                Fill::Partial => {}
                Fill::Complete(sequence) => break sequence,
            }
        };

        if check_space && new_space < 0 {
            self.space.adjust_padding(new_space)?;
        }
        Ok(sequence)
    }

    /// Places at most one part of `record` in the buffer.
    fn try_fill(
        &self,
        record: &mut dyn LogRecord,
        multi_part_id: u8,
        set_mark: bool,
        check_space: bool,
        flush: bool,
    ) -> Result<Fill> {
        let remaining = record.bytes_remaining();
        let completed = remaining <= self.max_part_len;
        let part_len = remaining.min(self.max_part_len);
        let first_part = record.is_first_part();
        let mut timer = self.stats.timer();

        let reservation = {
            let mut state = self.buffer.lock();
            timer.lap(Stage::WriteStalled);
            let start_buffer = Arc::clone(&state.current);
            let pages = start_buffer.number_of_pages();
            let reserved_address = state.next_free_byte;
            let start_page = self.cursors.last_page_filling();

            let pages_started =
                (part_len + PART_HEADER_LEN + reserved_address % PAGE_SIZE - 1) / (PAGE_SIZE - 1);
            let mut updated = reserved_address + part_len + PART_HEADER_LEN + pages_started;
            let wrapped = updated >= start_buffer.len_bytes();
            if wrapped {
                updated -= start_buffer.len_bytes();
            }
            let end_page = updated / PAGE_SIZE;

            let last_notified = self.cursors.last_page_notified();
            let next_to_last_notified = if last_notified == 0 {
                pages - 1
            } else {
                last_notified - 1
            };
            if overwrites_unnotified(start_page, end_page, next_to_last_notified) {
                self.stats.record_full_buffer();
                if state.new_buffer_pages == 0 {
                    state.new_buffer_pages = self.grown_buffer_pages(pages);
                }
                debug!(
                    start_page,
                    end_page,
                    next_to_last_notified,
                    pages,
                    new_buffer_pages = state.new_buffer_pages,
                    "wal.writer.buffer_full"
                );
                return Ok(Fill::BufferFull);
            }

            if set_mark || (multi_part_id != 0 && first_part) {
                let (file_size, start) = {
                    let header = self.header.lock();
                    (header.file_size, header.start_byte_address)
                };
                if multi_part_id != 0 && first_part {
                    let (address, sector_byte) = file_address(&state, reserved_address, file_size);
                    state.multi_part_starts[multi_part_id as usize] = Some(MultiPartStart {
                        address,
                        sector_byte,
                        unchecked_total: state.unchecked_total,
                    });
                }
                if set_mark {
                    Self::set_mark_point(&mut state, first_part, reserved_address, file_size, start);
                }
            }
            if !check_space {
                state.unchecked_total += (part_len + PART_HEADER_LEN) as u64;
            }

            if wrapped {
                let file_size = self.header.lock().file_size;
                if let Some(new_pages) = state.wrap_window(file_size) {
                    debug!(
                        old_pages = pages,
                        new_pages,
                        sequence = state.sequence_of_first_page,
                        "wal.buffer.grow"
                    );
                    if let Err(err) = self.recalculate_padding_target(new_pages, file_size) {
                        warn!(error = %err, "wal.space.padding_target_unchanged");
                    }
                }
            }

            let end_buffer = Arc::clone(&state.current);
            let sequence = if completed {
                if flush {
                    end_buffer
                        .page(end_page)
                        .waiter_exists
                        .store(true, Ordering::SeqCst);
                }
                if multi_part_id != 0 {
                    state.multi_part_starts[multi_part_id as usize] = None;
                }
                Some(state.sequence_of_first_page + end_page as u64)
            } else {
                None
            };

            start_buffer
                .page(start_page)
                .writers_active
                .fetch_add(1, Ordering::SeqCst);
            state.next_free_byte = updated;
            self.cursors
                .last_page_filling
                .store(end_page, Ordering::SeqCst);
            Reservation {
                start_buffer,
                end_buffer,
                start_page,
                end_page,
                reserved_address,
                sequence,
            }
        };
        timer.lap(Stage::WriteUpdateState);

        let header = PartHeader::for_data(completed, first_part, multi_part_id, part_len);
        {
            let mut writer = PageWriter::new(
                &reservation.start_buffer,
                &reservation.end_buffer,
                reservation.reserved_address,
            );
            writer.write_bytes(&header.encode());
            writer.write_with(part_len, |dst| {
                let copied = record.copy_into(dst);
                if copied < dst.len() {
                    dst[copied..].fill(0);
                }
            });
        }
        timer.lap(Stage::WriteCopying);

        if self.release_pages(&reservation.start_buffer, reservation.start_page) {
            self.flush_helper.signal(&self.failure)?;
        }
        timer.lap(Stage::WriteUpdateState);

        match reservation.sequence {
            Some(sequence) => {
                if flush {
                    self.wait_for_flush(&reservation.end_buffer, reservation.end_page)?;
                }
                Ok(Fill::Complete(sequence))
            }
            None => Ok(Fill::Partial),
        }
    }

    /// Moves the mark to the part being reserved, then back to the start of
    /// any multi-part record still being written.
    fn set_mark_point(
        state: &mut BufferState,
        first_part: bool,
        reserved_address: usize,
        file_size: u64,
        start: u64,
    ) {
        if first_part {
            let (address, sector_byte) = file_address(state, reserved_address, file_size);
            state.file_mark = address;
            state.file_mark_sector_byte = sector_byte;
            state.file_mark_unchecked = state.unchecked_total;
        }
        let earliest = state
            .multi_part_starts
            .iter()
            .flatten()
            .min_by_key(|entry| offset_from_start(entry.address, start, file_size))
            .copied();
        if let Some(entry) = earliest {
            if offset_from_start(entry.address, start, file_size)
                < offset_from_start(state.file_mark, start, file_size)
            {
                state.file_mark = entry.address;
                state.file_mark_sector_byte = entry.sector_byte;
                state.file_mark_unchecked = entry.unchecked_total;
            }
        }
        debug!(
            mark = state.file_mark,
            sector_byte = state.file_mark_sector_byte,
            "wal.writer.mark"
        );
    }

    /// Drops this producer's writer count on its start page, then marks every
    /// page that is now complete as flush pending. Returns true if any page
    /// became pending.
    fn release_pages(&self, start_buffer: &Arc<LogBuffer>, start_page: usize) -> bool {
        let mut buffer = Arc::clone(start_buffer);
        let mut page = start_page;
        let mut released_own = false;
        let mut start_flush = false;
        loop {
            if page == buffer.number_of_pages() {
                page = 0;
                buffer = self.current_buffer();
            }
            let slot = buffer.page(page);
            let mut page_state = slot.state.lock();
            if !released_own {
                slot.writers_active.fetch_sub(1, Ordering::SeqCst);
                released_own = true;
            }
            if page == self.cursors.last_page_filling() {
                break;
            }
            if slot.writers() != 0 || page != self.cursors.first_page_filling() {
                break;
            }
            page_state.flush_pending = true;
            let next = if page + 1 == buffer.number_of_pages() {
                0
            } else {
                page + 1
            };
            self.cursors
                .first_page_filling
                .store(next, Ordering::SeqCst);
            start_flush = true;
            drop(page_state);
            page += 1;
        }
        start_flush
    }

    /// Blocks until everything appended so far is on disk.
    pub(crate) fn flush(&self) -> Result<()> {
        self.failure.check()?;
        let (buffer, page) = {
            let state = self.buffer.lock();
            let page = self.cursors.last_page_filling();
            // An untouched filling page with everything before it written.
            if state.draining.is_none()
                && state.next_free_byte % PAGE_SIZE == 1
                && self.cursors.first_page_to_flush() == page
            {
                return Ok(());
            }
            state
                .current
                .page(page)
                .waiter_exists
                .store(true, Ordering::SeqCst);
            (Arc::clone(&state.current), page)
        };
        self.wait_for_flush(&buffer, page)
    }

    /// Waits until the notify helper releases `page`.
    pub(crate) fn wait_for_flush(&self, buffer: &LogBuffer, page: usize) -> Result<()> {
        self.stats.record_flush_request();
        let slot = buffer.page(page);
        let mut wait = slot.wait.lock();
        if slot.has_waiter() {
            wait.waiters += 1;
            if page == self.cursors.first_page_filling() {
                self.flush_helper.signal(&self.failure)?;
            }
            let generation = wait.generation;
            while wait.generation == generation && !self.failure.is_stopped() {
                slot.flushed.wait(&mut wait);
            }
        }
        drop(wait);
        self.failure.check()
    }

    /// Makes the flush helper run a pass whether or not a page is pending.
    pub(crate) fn kick_flush_helper(&self) -> Result<()> {
        self.flush_kick.store(true, Ordering::SeqCst);
        self.flush_helper.signal(&self.failure)
    }

    /// Blocks until `done` holds, re-checking after every flush pass.
    pub(crate) fn wait_for_pass(&self, mut done: impl FnMut() -> bool) -> Result<()> {
        let idle = self.options.flush_idle_wait();
        let mut guard = self.pass_lock.lock();
        while !done() {
            self.failure.check()?;
            self.pass_done.wait_for(&mut guard, idle);
        }
        Ok(())
    }

    pub(crate) fn finish_pass(&self) {
        let _guard = self.pass_lock.lock();
        self.pass_done.notify_all();
    }

    fn grown_buffer_pages(&self, pages: usize) -> usize {
        let file_size = self.header.lock().file_size;
        let cap = ((file_size - HEADER_REGION_LEN) / PAGE_SIZE as u64 / 2) as usize;
        let grown = (pages * 2).min(self.options.max_buffer_pages).min(cap);
        if grown > pages {
            grown
        } else {
            0
        }
    }

    /// Sizes the padding pool at one page per buffer-length of file, and at
    /// least the configured minimum.
    pub(crate) fn recalculate_padding_target(
        &self,
        buffer_pages: usize,
        file_size: u64,
    ) -> Result<()> {
        let buffer_bytes = (buffer_pages * PAGE_SIZE) as u64;
        let buffers_per_log = (file_size - HEADER_REGION_LEN) / buffer_bytes;
        let target = (buffers_per_log * PAGE_SIZE as u64)
            .max(self.options.padding_minimum_pages * PAGE_SIZE as u64);
        self.space.set_padding_target(target as i64)
    }

    /// Single exit for a helper that hit an error it cannot recover from.
    pub(crate) fn abnormal_termination(&self, thread: &'static str, err: WalError) {
        error!(thread, error = %err, "wal.helper.abnormal_termination");
        let cause = self.failure.record_abnormal(thread, err);
        self.flush_helper.stop();
        self.notify_helper.stop();
        self.authority.request_shutdown(&cause);
        self.wake_all_waiters();
    }

    pub(crate) fn wake_all_waiters(&self) {
        let buffers = self.buffer.lock().live_buffers();
        for buffer in buffers {
            buffer.wake_all();
        }
    }
}
