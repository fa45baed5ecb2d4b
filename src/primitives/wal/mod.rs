#![forbid(unsafe_code)]

//! Circular, page-buffered write-ahead log.
//!
//! Producers copy record parts into an in-memory ring of pages in parallel.
//! A flush helper thread writes completed pages to the file in batches,
//! cycling back to the first data page at the end of the file, and a notify
//! helper wakes producers whose pages reached the disk. Each 512-byte sector
//! carries a marker bit that flips on every cycle, so a reader can tell
//! current pages from stale ones without a per-page checksum.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{Result, WalError};

pub mod authority;
pub(crate) mod buffer;
mod flush;
pub mod header;
mod lifecycle;
mod multipart;
mod notify;
pub mod options;
pub mod record;
pub mod scan;
pub mod sector;
pub mod space;
pub mod stats;
mod writer;

pub use authority::{CheckpointAuthority, NoopAuthority};
pub use buffer::{BufferSnapshot, PageSnapshot};
pub use header::FileLogHeader;
pub use options::LogOptions;
pub use record::{LogRecord, PartHeader, PartKind, PayloadRecord};
pub use scan::{LogScan, LogScanner, ScannedRecord};
pub use space::SpaceAccountant;
pub use stats::{SpaceGauges, StatsSnapshot};

use buffer::{BufferState, Cursors, LogBuffer};
use flush::{format_region, FlushWorker, FLUSH_HELPER};
use lifecycle::{FailureState, HelperControl};
use multipart::MultiPartIds;
use notify::{NotifyWorker, NOTIFY_HELPER};
use options::check_file_size;
use stats::LogStatistics;
use writer::{LogShared, ResizeRequest};

/// Size of a log page, in memory and on disk.
pub const PAGE_SIZE: usize = 4096;
/// Size of a sector; its last bit is the cycle marker.
pub const SECTOR_SIZE: usize = 512;
/// Length of one header copy. Two copies fill the first page.
pub const FILE_HEADER_LEN: usize = 2048;
/// Bytes in front of the first data page.
pub const HEADER_REGION_LEN: u64 = PAGE_SIZE as u64;
/// Header in front of every record part.
pub const PART_HEADER_LEN: usize = 4;
/// Largest payload carried by one part.
pub const MAX_LOG_RECORD_PART: usize = 16 * 1024 - PART_HEADER_LEN;
/// Multi-part ids; id 0 marks single-part records.
pub const MULTI_PART_IDS: usize = 127;
/// Pages formatted per write when a file is created or grown.
pub const FORMAT_BATCH_PAGES: usize = 1024;
/// Sequence number of the first page of a new log.
pub const FIRST_SEQUENCE: u64 = 1;

/// Where a recovered log continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    /// Sequence number of the last page recovery found.
    pub last_sequence: u64,
    /// File page index the next write lands on.
    pub next_page: u64,
}

/// Earliest address a truncation must keep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkPoint {
    /// File byte address.
    pub address: u64,
    /// Sector marker value of the page holding `address`.
    pub sector_byte: u8,
}

struct Helpers {
    flush: JoinHandle<()>,
    notify: JoinHandle<()>,
}

/// Resizes that keep deferring give up after this many flush passes.
const RESIZE_ATTEMPTS: usize = 16;

/// Handle to an open log. Cheap to share behind an `Arc`; every method
/// takes `&self`.
pub struct LogWriter {
    shared: Arc<LogShared>,
    helpers: Mutex<Option<Helpers>>,
    simulated_full: Mutex<i64>,
}

impl LogWriter {
    /// Formats `io` as an empty log of `options.file_size` bytes and opens it.
    pub fn create(
        io: Arc<dyn FileIo>,
        options: LogOptions,
        authority: Arc<dyn CheckpointAuthority>,
    ) -> Result<Self> {
        options.validate()?;
        let file_size = options.creation_file_size()?;
        format_region(io.as_ref(), HEADER_REGION_LEN, file_size, 0)?;
        let mut header = FileLogHeader::new(file_size);
        header.write(io.as_ref())?;
        info!(file_size, "wal.create");
        Self::open_common(
            io,
            options,
            authority,
            header,
            HEADER_REGION_LEN,
            FIRST_SEQUENCE,
        )
    }

    /// Creates a log at `path` with no checkpoint collaborator.
    pub fn create_path(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let io = Arc::new(StdFileIo::open(path.as_ref())?);
        Self::create(io, options, Arc::new(NoopAuthority))
    }

    /// Reopens an existing log after recovery found where it ends.
    pub fn resume(
        io: Arc<dyn FileIo>,
        options: LogOptions,
        authority: Arc<dyn CheckpointAuthority>,
        point: ResumePoint,
    ) -> Result<Self> {
        options.validate()?;
        let header = FileLogHeader::read(io.as_ref())?;
        if io.len()? > header.file_size {
            // A shrink that stopped between the header write and the cut.
            io.truncate(header.file_size)?;
        }
        let position = point.next_page * PAGE_SIZE as u64;
        if position < HEADER_REGION_LEN || position >= header.file_size {
            return Err(WalError::Invalid("resume point lies outside the log file"));
        }
        info!(
            file_size = header.file_size,
            start = header.start_byte_address,
            position,
            last_sequence = point.last_sequence,
            "wal.resume"
        );
        Self::open_common(
            io,
            options,
            authority,
            header,
            position,
            point.last_sequence + 1,
        )
    }

    fn open_common(
        io: Arc<dyn FileIo>,
        options: LogOptions,
        authority: Arc<dyn CheckpointAuthority>,
        header: FileLogHeader,
        position: u64,
        first_sequence: u64,
    ) -> Result<Self> {
        let file_size = header.file_size;
        let pages = options.initial_buffer_pages;
        check_file_size(file_size, pages)?;

        let sector_byte = if position < header.start_byte_address {
            sector::flip(header.sector_byte)
        } else {
            header.sector_byte
        };
        let mut left = header.start_byte_address as i64 - position as i64;
        if left <= 0 {
            left += (file_size - HEADER_REGION_LEN) as i64;
        }
        // Sector bytes are not usable, and one page stays free as the gap.
        let total = left - (left as u64).div_ceil(PAGE_SIZE as u64) as i64 - PAGE_SIZE as i64;
        let max_part_len = MAX_LOG_RECORD_PART.min((pages - 2) * (PAGE_SIZE - 1) - 5);

        let buffer = Arc::new(LogBuffer::new(pages));
        let state = BufferState::new(
            Arc::clone(&buffer),
            first_sequence,
            position,
            sector_byte,
            header.start_byte_address,
            header.sector_byte,
        );
        let gather_statistics = options.gather_statistics;
        let shared = Arc::new(LogShared {
            io,
            options,
            authority,
            header: Mutex::new(header.clone()),
            buffer: Mutex::new(state),
            cursors: Cursors::new(pages),
            space: SpaceAccountant::new(total),
            multi_part_ids: MultiPartIds::new(),
            mark_lock: Mutex::new(()),
            truncate_requested: AtomicBool::new(false),
            resize: Mutex::new(ResizeRequest::default()),
            resize_lock: Mutex::new(()),
            flush_kick: AtomicBool::new(false),
            pass_lock: Mutex::new(()),
            pass_done: Condvar::new(),
            file_position: AtomicU64::new(position),
            occupancy_high: AtomicBool::new(false),
            flush_helper: HelperControl::new(FLUSH_HELPER),
            notify_helper: HelperControl::new(NOTIFY_HELPER),
            failure: FailureState::default(),
            stats: LogStatistics::new(gather_statistics),
            max_part_len,
        });
        shared.recalculate_padding_target(pages, file_size)?;

        let notify = NotifyWorker::new(Arc::clone(&shared), Arc::clone(&buffer));
        let notify = thread::Builder::new()
            .name("ringwal-notify".into())
            .spawn(move || notify.run())?;
        let flush = FlushWorker::new(Arc::clone(&shared), buffer, position, sector_byte);
        let flush = match thread::Builder::new()
            .name("ringwal-flush".into())
            .spawn(move || flush.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                shared.notify_helper.stop();
                let _ = notify.join();
                return Err(err.into());
            }
        };
        debug!(
            file_size,
            start = header.start_byte_address,
            position,
            sector_byte,
            first_sequence,
            space = total,
            max_part_len,
            "wal.open"
        );
        Ok(Self {
            shared,
            helpers: Mutex::new(Some(Helpers { flush, notify })),
            simulated_full: Mutex::new(0),
        })
    }

    /// Appends `record` and returns the sequence number of the page holding
    /// its last byte.
    ///
    /// `reserved_delta` adjusts space the caller reserved earlier; with
    /// `check_space` false the record's bytes were already reserved through
    /// [`LogWriter::reserve`]. With `force_flush` the call returns only once
    /// the record is on disk.
    pub fn append(
        &self,
        record: &mut dyn LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force_flush: bool,
    ) -> Result<u64> {
        self.shared
            .add_log_record(record, reserved_delta, false, check_space, force_flush)
    }

    /// Like [`LogWriter::append`], and moves the truncation mark to the start
    /// of this record.
    pub fn append_and_mark(
        &self,
        record: &mut dyn LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force_flush: bool,
    ) -> Result<u64> {
        let _mark = self.shared.mark_lock.lock();
        self.shared
            .add_log_record(record, reserved_delta, true, check_space, force_flush)
    }

    /// Appends a payload, reserving its space.
    pub fn append_bytes(&self, payload: impl Into<Bytes>, force_flush: bool) -> Result<u64> {
        let mut record = PayloadRecord::new(payload);
        self.append(&mut record, 0, true, force_flush)
    }

    /// Appends a payload and marks it as the truncation point.
    pub fn append_and_mark_bytes(
        &self,
        payload: impl Into<Bytes>,
        force_flush: bool,
    ) -> Result<u64> {
        let mut record = PayloadRecord::new(payload);
        self.append_and_mark(&mut record, 0, true, force_flush)
    }

    /// Blocks until everything appended so far is on disk.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Flushes, then moves the start of the log to the mark point.
    pub fn truncate(&self) -> Result<()> {
        let shared = &self.shared;
        shared.flush()?;
        let _mark = shared.mark_lock.lock();
        // A mark set since the first flush must be on disk before it becomes
        // the start.
        shared.flush()?;
        shared.truncate_requested.store(true, Ordering::SeqCst);
        shared.kick_flush_helper()?;
        shared.wait_for_pass(|| !shared.truncate_requested.load(Ordering::SeqCst))?;
        let header = shared.header.lock();
        info!(
            start = header.start_byte_address,
            sector_byte = header.sector_byte,
            "wal.truncate"
        );
        Ok(())
    }

    /// Reserves `delta` bytes for later unchecked appends. A negative delta
    /// hands space back, refilling the padding reserve first.
    pub fn reserve(&self, delta: i64) -> Result<()> {
        self.shared.failure.check()?;
        if delta < 0 {
            self.shared.space.adjust_padding(delta)
        } else {
            self.shared.space.reserve(delta)
        }
    }

    /// Resizes the log file, waiting for checkpoints until live data fits.
    ///
    /// The size is rounded down to a page. Fails with
    /// [`WalError::FileSizeTooSmall`] when the resulting occupancy would
    /// exceed the high threshold.
    pub fn set_file_size(&self, file_size: u64) -> Result<()> {
        let shared = &self.shared;
        shared.failure.check()?;
        let new_size = file_size - file_size % PAGE_SIZE as u64;
        check_file_size(new_size, shared.current_buffer().number_of_pages())?;
        let _serial = shared.resize_lock.lock();
        let old_size = shared.header.lock().file_size;
        if new_size == old_size {
            return Ok(());
        }
        let threshold = shared.options.occupancy_high_threshold;
        let mut occupancy;
        let mut attempts = 0;
        loop {
            let left = shared.space.available() as f64;
            occupancy = (1.0 - (left - old_size as f64 + new_size as f64) / new_size as f64) as f32;
            if occupancy > threshold {
                shared.resize.lock().pending = None;
                warn!(new_size, occupancy, threshold, "wal.resize.too_small");
                return Err(WalError::FileSizeTooSmall {
                    requested: new_size,
                    occupancy,
                    threshold,
                });
            }
            let seen = {
                let mut resize = shared.resize.lock();
                resize.pending = Some(new_size);
                resize.error = None;
                resize.deferred
            };
            shared.kick_flush_helper()?;
            shared.wait_for_pass(|| {
                let resize = shared.resize.lock();
                resize.pending.is_none() || resize.deferred != seen
            })?;
            {
                let mut resize = shared.resize.lock();
                if resize.pending.is_none() {
                    return match resize.error.take() {
                        Some(err) => Err(err),
                        None => {
                            info!(old_size, new_size, "wal.resize");
                            Ok(())
                        }
                    };
                }
                attempts += 1;
                if attempts >= RESIZE_ATTEMPTS {
                    resize.pending = None;
                    break;
                }
            }
            shared.authority.wait_for_checkpoint()?;
            shared.flush()?;
        }
        warn!(new_size, attempts, "wal.resize.gave_up");
        if new_size < old_size {
            Err(WalError::FileSizeTooSmall {
                requested: new_size,
                occupancy,
                threshold,
            })
        } else {
            Err(WalError::Invalid(
                "log resize found no point where live data clears the file end",
            ))
        }
    }

    /// Claims all free space, as though the log were full, or hands it back.
    /// Claiming keeps flushing and waiting for checkpoints until three rounds
    /// in a row free nothing.
    pub fn simulate_full(&self, full: bool) -> Result<()> {
        let shared = &self.shared;
        let mut held = self.simulated_full.lock();
        if !full {
            if *held > 0 {
                shared.space.reserve(-*held)?;
                debug!(released = *held, "wal.simulate_full");
                *held = 0;
            }
            return Ok(());
        }
        let mut idle_rounds = 0;
        while idle_rounds < 3 {
            let free = shared.space.available();
            if free > 0 && shared.space.reserve_from_shards(free) == 0 {
                *held += free;
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
            }
            shared.flush()?;
            shared.authority.wait_for_checkpoint()?;
        }
        debug!(held = *held, "wal.simulate_full");
        Ok(())
    }

    /// Free bytes outside the padding reserve.
    pub fn space_left(&self) -> i64 {
        self.shared.space.available()
    }

    /// Current file size.
    pub fn file_size(&self) -> u64 {
        self.shared.header.lock().file_size
    }

    /// Size of a resize still in progress, or the current size.
    pub fn requested_file_size(&self) -> u64 {
        self.shared
            .resize
            .lock()
            .pending
            .unwrap_or_else(|| self.file_size())
    }

    /// True once occupancy passed the high threshold at the last flush.
    pub fn is_occupancy_high(&self) -> bool {
        self.shared.occupancy_high.load(Ordering::SeqCst)
    }

    /// Copy of the in-memory file header.
    pub fn header(&self) -> FileLogHeader {
        self.shared.header.lock().clone()
    }

    /// The address a truncation would move the start to.
    pub fn mark_point(&self) -> MarkPoint {
        let state = self.shared.buffer.lock();
        MarkPoint {
            address: state.file_mark,
            sector_byte: state.file_mark_sector_byte,
        }
    }

    /// Cursors and per-page state at this instant.
    pub fn buffer_snapshot(&self) -> BufferSnapshot {
        let state = self.shared.buffer.lock();
        let file_position = self.shared.file_position.load(Ordering::SeqCst);
        BufferSnapshot::capture(&state, &self.shared.cursors, file_position)
    }

    /// Returns the counters gathered since the last capture and resets them.
    pub fn capture_statistics(&self) -> StatsSnapshot {
        let shared = &self.shared;
        let (unchecked_bytes, unchecked_bytes_up_to_mark, buffer_pages) = {
            let state = shared.buffer.lock();
            (
                state.unchecked_total - state.file_mark_unchecked,
                state
                    .file_mark_unchecked
                    .saturating_sub(state.truncated_unchecked),
                state.current.number_of_pages() as u64,
            )
        };
        let gauges = SpaceGauges {
            space_left: shared.space.available(),
            padding_available: shared.space.padding_available(),
            padding_target: shared.space.padding_target(),
            file_size: shared.header.lock().file_size,
            unchecked_bytes,
            unchecked_bytes_up_to_mark,
            buffer_pages,
        };
        shared.stats.capture(gauges)
    }

    /// Flushes, stops both helpers and wakes anyone still waiting. Later
    /// calls fail with [`WalError::ThreadNotRunning`].
    pub fn close(&self) -> Result<()> {
        let Some(helpers) = self.helpers.lock().take() else {
            return Ok(());
        };
        let flushed = if self.shared.failure.is_stopped() {
            Ok(())
        } else {
            self.shared.flush()
        };
        self.shared.flush_helper.stop();
        let flush_joined = helpers.flush.join();
        self.shared.notify_helper.stop();
        let notify_joined = helpers.notify.join();
        self.shared.failure.record_shutdown();
        self.shared.wake_all_waiters();
        debug!(
            file_position = self.shared.file_position.load(Ordering::SeqCst),
            "wal.close"
        );
        if flush_joined.is_err() {
            return Err(WalError::Unexpected("flush helper panicked".into()));
        }
        if notify_joined.is_err() {
            return Err(WalError::Unexpected("notify helper panicked".into()));
        }
        flushed
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "wal.close_failed");
        }
    }
}
