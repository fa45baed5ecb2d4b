//! The flush helper: the only thread that writes log pages to the file.

use std::io::IoSlice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::Result;

use super::buffer::LogBuffer;
use super::record::{PartHeader, PartKind};
use super::stats::{Stage, StageTimer};
use super::writer::{offset_from_start, LogShared};
use super::{sector, FORMAT_BATCH_PAGES, HEADER_REGION_LEN, PAGE_SIZE, PART_HEADER_LEN};

pub(crate) const FLUSH_HELPER: &str = "flush helper";

pub(crate) struct FlushWorker {
    shared: Arc<LogShared>,
    /// Buffer holding `first_page_to_flush`; may trail the filling buffer.
    buffer: Arc<LogBuffer>,
    file_position: u64,
    sector_byte: u8,
}

impl FlushWorker {
    pub(crate) fn new(
        shared: Arc<LogShared>,
        buffer: Arc<LogBuffer>,
        file_position: u64,
        sector_byte: u8,
    ) -> Self {
        Self {
            shared,
            buffer,
            file_position,
            sector_byte,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(
            file_position = self.file_position,
            sector_byte = self.sector_byte,
            "wal.flush.start"
        );
        if let Err(err) = self.run_loop() {
            self.shared.abnormal_termination(FLUSH_HELPER, err);
        }
        debug!(file_position = self.file_position, "wal.flush.exit");
    }

    fn run_loop(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let control = &shared.flush_helper;
        let idle = shared.options.flush_idle_wait();
        let mut timer = shared.stats.timer();
        loop {
            control.active.store(false, Ordering::SeqCst);
            {
                let mut state = control.state.lock();
                let mut ready = self.work_ready();
                if !ready {
                    shared.stats.record_flush_helper_wait();
                }
                while !ready {
                    if !state.running {
                        return Ok(());
                    }
                    state.waiting = true;
                    control.wakeup.wait_for(&mut state, idle);
                    state.waiting = false;
                    ready = self.work_ready();
                }
                control.active.store(true, Ordering::SeqCst);
            }
            timer.lap(Stage::FlushHelperWaiting);

            let first = shared.cursors.first_page_to_flush();
            if !self.buffer.page(first).flush_pending()
                && first == shared.cursors.last_page_filling()
            {
                self.pad_log_buffer(&mut timer)?;
            }
            let filling = shared.cursors.first_page_filling();
            self.perform_flush(filling)?;
            shared.finish_pass();
            timer.lap(Stage::Flushing);
            if shared.cursors.first_page_to_flush() != first {
                shared.notify_helper.request_page(filling)?;
            }
            timer.lap(Stage::FlushOther);
        }
    }

    /// Pending pages exist, the single filling page has a waiter and the
    /// notify helper has caught up, or a pass was explicitly requested.
    /// Consumes the request.
    fn work_ready(&self) -> bool {
        let cursors = &self.shared.cursors;
        let first = cursors.first_page_to_flush();
        let slot = self.buffer.page(first);
        slot.flush_pending()
            || (slot.has_waiter()
                && first == cursors.last_page_filling()
                && first == cursors.next_page_to_notify())
            || self.shared.flush_kick.swap(false, Ordering::SeqCst)
    }

    /// Completes the partially filled page someone is waiting on so it can
    /// be written. Does nothing until the notify helper has caught up.
    fn pad_log_buffer(&mut self, timer: &mut StageTimer<'_>) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let cursors = &shared.cursors;
        let mut state = shared.buffer.lock();
        timer.lap(Stage::PaddingStalled);

        let buffer = Arc::clone(&state.current);
        let first = cursors.first_page_to_flush();
        // Padding while notification lags would hand the gap page to producers.
        if !Arc::ptr_eq(&buffer, &self.buffer)
            || first != cursors.last_page_filling()
            || first != cursors.next_page_to_notify()
            || !buffer.page(first).has_waiter()
            || buffer.page(first).flush_pending()
        {
            return Ok(());
        }

        let next_free = state.next_free_byte;
        let page = next_free / PAGE_SIZE;
        let in_page = next_free % PAGE_SIZE;
        let padding = PAGE_SIZE - in_page;
        shared.stats.record_padding(padding as u64);
        shared.space.adjust_padding(padding as i64)?;
        {
            let mut data = buffer.page(page).data.lock();
            let dst = &mut data[in_page..];
            if padding < PART_HEADER_LEN {
                dst.fill(PartKind::Padding as u8);
            } else {
                let header = PartHeader {
                    kind: PartKind::Padding,
                    multi_part_id: 0,
                    len: (padding - PART_HEADER_LEN) as u16,
                };
                dst[..PART_HEADER_LEN].copy_from_slice(&header.encode());
                dst[PART_HEADER_LEN..].fill(0);
            }
        }

        // Step over the next page's sector byte.
        let mut updated = next_free + padding + 1;
        if updated >= buffer.len_bytes() {
            updated -= buffer.len_bytes();
            let file_size = shared.header.lock().file_size;
            if let Some(new_pages) = state.wrap_window(file_size) {
                debug!(new_pages, "wal.buffer.grow");
                if let Err(err) = shared.recalculate_padding_target(new_pages, file_size) {
                    warn!(error = %err, "wal.space.padding_target_unchanged");
                }
            }
        }
        state.next_free_byte = updated;
        cursors
            .last_page_filling
            .store(updated / PAGE_SIZE, Ordering::SeqCst);

        let slot = buffer.page(first);
        let mut page_state = slot.state.lock();
        if slot.writers() == 0 && first == cursors.first_page_filling() {
            page_state.flush_pending = true;
            let next = if first + 1 == buffer.number_of_pages() {
                0
            } else {
                first + 1
            };
            cursors.first_page_filling.store(next, Ordering::SeqCst);
        }
        debug!(page, padding, "wal.flush.pad");
        Ok(())
    }

    /// Writes pages `first_page_to_flush..filling`, cycling to the start of
    /// the file when the batch reaches its end, then applies any pending
    /// truncation or resize.
    fn perform_flush(&mut self, filling: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let first = shared.cursors.first_page_to_flush();
        let pages = self.buffer.number_of_pages();
        // Counts a full ring as empty; the empty second write after a cycle
        // absorbs the difference.
        let mut pages_to_write = filling as i64 - first as i64;
        if pages_to_write < 0 {
            pages_to_write += pages as i64;
        }
        let mut bytes_to_write = pages_to_write as u64 * PAGE_SIZE as u64;
        shared.stats.record_write(pages_to_write as u64, bytes_to_write);

        let file_size = shared.header.lock().file_size;
        let cycle = file_size - self.file_position <= bytes_to_write;
        let mut end_page = filling;
        if cycle {
            bytes_to_write = file_size - self.file_position;
            end_page = first + (bytes_to_write / PAGE_SIZE as u64) as usize;
            if end_page >= pages {
                end_page -= pages;
            }
        }
        self.write_and_cycle_buffer(first, end_page)?;
        if cycle {
            self.sector_byte = sector::flip(self.sector_byte);
            self.file_position = HEADER_REGION_LEN;
            shared.stats.record_cycle();
            debug!(sector_byte = self.sector_byte, "wal.flush.cycle");
            self.write_and_cycle_buffer(end_page, filling)?;
        }

        if shared.truncate_requested.load(Ordering::SeqCst) {
            self.truncate_to_mark()?;
        }
        self.apply_resize_request()?;

        if shared.options.sync_on_flush && pages_to_write > 0 {
            shared.io.sync_all()?;
        }
        shared
            .cursors
            .first_page_to_flush
            .store(filling, Ordering::SeqCst);
        shared
            .file_position
            .store(self.file_position, Ordering::SeqCst);
        self.check_occupancy();
        Ok(())
    }

    fn write_and_cycle_buffer(&mut self, start: usize, end: usize) -> Result<()> {
        self.write_pages(start, end)?;
        if end < start {
            self.buffer = self.shared.current_buffer();
        }
        Ok(())
    }

    /// Stamps sector markers on pages `start..end` (continuing into the
    /// filling buffer past the end of this one) and writes them in one call.
    fn write_pages(&mut self, start: usize, end: usize) -> Result<()> {
        if start == end {
            return Ok(());
        }
        let first_buffer = Arc::clone(&self.buffer);
        let next_buffer = self.shared.current_buffer();
        let bytes = {
            let mut guards = Vec::new();
            let mut buffer: &LogBuffer = &first_buffer;
            let mut page = start;
            loop {
                if page == buffer.number_of_pages() {
                    page = 0;
                    buffer = &next_buffer;
                }
                if page == end {
                    break;
                }
                let mut data = buffer.page(page).data.lock();
                sector::set_sector_bits(&mut data, self.sector_byte);
                guards.push(data);
                page += 1;
            }
            let slices: Vec<IoSlice<'_>> = guards.iter().map(|data| IoSlice::new(data)).collect();
            self.shared.io.writev_at(self.file_position, &slices)?;
            debug!(
                position = self.file_position,
                pages = guards.len(),
                sector_byte = self.sector_byte,
                "wal.flush.write"
            );
            (guards.len() * PAGE_SIZE) as u64
        };
        self.file_position += bytes;
        Ok(())
    }

    /// Rewrites the header with the mark point as the new start and returns
    /// the reclaimed bytes to the space pools.
    fn truncate_to_mark(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let (mark, mark_sector_byte, unchecked) = {
            let mut state = shared.buffer.lock();
            let unchecked = state
                .file_mark_unchecked
                .saturating_sub(state.truncated_unchecked);
            state.truncated_unchecked = state.truncated_unchecked.max(state.file_mark_unchecked);
            (state.file_mark, state.file_mark_sector_byte, unchecked)
        };
        let mut header = shared.header.lock().clone();
        let regained = offset_from_start(mark, header.start_byte_address, header.file_size);
        header.start_byte_address = mark;
        header.sector_byte = mark_sector_byte;
        header.write(shared.io.as_ref())?;
        *shared.header.lock() = header;

        let sector_bytes = regained / PAGE_SIZE as u64;
        shared
            .space
            .adjust_padding(unchecked as i64 - regained as i64 + sector_bytes as i64)?;
        shared.truncate_requested.store(false, Ordering::SeqCst);
        debug!(
            start = mark,
            sector_byte = mark_sector_byte,
            regained,
            unchecked,
            "wal.flush.truncate"
        );
        Ok(())
    }

    /// Applies a pending resize once the live region sits where neither the
    /// old nor the new file end cuts through it.
    fn apply_resize_request(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let Some(new_size) = shared.resize.lock().pending else {
            return Ok(());
        };
        let state = shared.buffer.lock();
        let mut header = shared.header.lock().clone();
        let old_size = header.file_size;
        if new_size == old_size {
            shared.resize.lock().pending = None;
            return Ok(());
        }
        let window_end = state.buffer_file_position + state.current.len_bytes() as u64;
        let safe = header.start_byte_address <= self.file_position
            && header.start_byte_address <= state.buffer_file_position
            && window_end <= old_size.min(new_size);
        if !safe {
            shared.resize.lock().deferred += 1;
            debug!(
                new_size,
                start = header.start_byte_address,
                file_position = self.file_position,
                window_end,
                "wal.flush.resize_deferred"
            );
            return Ok(());
        }

        let page = PAGE_SIZE as u64;
        if new_size < old_size {
            let removed = (old_size - new_size) as i64 - ((old_size - new_size) / page) as i64;
            if shared.space.reserve_from_shards(removed) != 0 {
                shared.resize.lock().deferred += 1;
                debug!(new_size, removed, "wal.flush.resize_deferred");
                return Ok(());
            }
            header.file_size = new_size;
            header.write(shared.io.as_ref())?;
            shared.io.truncate(new_size)?;
        } else {
            let marker = sector::flip(self.sector_byte);
            if let Err(err) = format_region(shared.io.as_ref(), old_size, new_size, marker) {
                warn!(new_size, error = %err, "wal.flush.resize_failed");
                let mut resize = shared.resize.lock();
                resize.pending = None;
                resize.error = Some(err);
                return Ok(());
            }
            let added = (new_size - old_size) as i64 - ((new_size - old_size) / page) as i64;
            shared.space.reserve_from_shards(-added);
            header.file_size = new_size;
            header.write(shared.io.as_ref())?;
        }
        *shared.header.lock() = header;
        shared.resize.lock().pending = None;
        let buffer_pages = state.current.number_of_pages();
        drop(state);
        if let Err(err) = shared.recalculate_padding_target(buffer_pages, new_size) {
            warn!(error = %err, "wal.space.padding_target_unchanged");
        }
        debug!(old_size, new_size, "wal.flush.resize");
        Ok(())
    }

    fn check_occupancy(&self) {
        let shared = &self.shared;
        let file_size = shared.header.lock().file_size;
        let available = shared.space.available().max(0) as f64;
        let occupancy = (1.0 - available / file_size as f64) as f32;
        let high = occupancy > shared.options.occupancy_high_threshold;
        let was_high = shared.occupancy_high.swap(high, Ordering::SeqCst);
        if high && !was_high {
            warn!(occupancy, "wal.flush.occupancy_high");
            shared.authority.occupancy_high(occupancy);
        }
        if occupancy > shared.options.checkpoint_threshold {
            debug!(occupancy, "wal.flush.occupancy");
            shared.stats.record_checkpoint_triggered();
            shared.authority.suggest_checkpoint(occupancy);
        }
    }
}

/// Extends the file to `new_size` and stamps `[from, new_size)` with `marker`.
pub(crate) fn format_region(
    io: &dyn FileIo,
    from: u64,
    new_size: u64,
    marker: u8,
) -> Result<()> {
    io.truncate(new_size)?;
    let mut position = from;
    while position < new_size {
        let pages = (((new_size - position) / PAGE_SIZE as u64) as usize).min(FORMAT_BATCH_PAGES);
        let formatted = sector::formatted_pages(pages, marker);
        io.write_at(position, &formatted)?;
        position += formatted.len() as u64;
    }
    io.sync_all()
}
