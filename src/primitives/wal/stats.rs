use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Bins in each histogram: counts 0 through 15, then everything larger.
pub const HISTOGRAM_BINS: usize = 17;

/// Counters owned by one log writer. Cleared by every capture.
#[derive(Debug, Default)]
pub(crate) struct LogStatistics {
    timings: bool,
    bytes_written: AtomicU64,
    flush_requests: AtomicU64,
    log_buffer_writes: AtomicU64,
    threads_finding_full_buffers: AtomicU64,
    flush_helper_waits: AtomicU64,
    log_cycles: AtomicU64,
    checkpoints_triggered: AtomicU64,
    stalled_for_multi_part_id: AtomicU64,
    padding_bytes: AtomicU64,
    padding_records: AtomicU64,
    write_stalled_ns: AtomicU64,
    write_copying_ns: AtomicU64,
    write_update_state_ns: AtomicU64,
    padding_stalled_ns: AtomicU64,
    flush_helper_waiting_ns: AtomicU64,
    flushing_ns: AtomicU64,
    flush_other_ns: AtomicU64,
    flush_waiters: [AtomicU64; HISTOGRAM_BINS],
    pages_written: [AtomicU64; HISTOGRAM_BINS],
}

/// Which timing bucket a lap is charged to.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Stage {
    WriteStalled,
    WriteCopying,
    WriteUpdateState,
    PaddingStalled,
    FlushHelperWaiting,
    Flushing,
    FlushOther,
}

/// Measures consecutive stages of one operation.
pub(crate) struct StageTimer<'a> {
    stats: &'a LogStatistics,
    last: Option<Instant>,
}

impl StageTimer<'_> {
    /// Charges the time since the previous lap to `stage`.
    pub(crate) fn lap(&mut self, stage: Stage) {
        if let Some(last) = self.last {
            let now = Instant::now();
            self.stats
                .add_time(stage, now.duration_since(last).as_nanos() as u64);
            self.last = Some(now);
        }
    }
}

fn bin(count: u64) -> usize {
    (count as usize).min(HISTOGRAM_BINS - 1)
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn take(counter: &AtomicU64) -> u64 {
    counter.swap(0, Ordering::Relaxed)
}

fn take_histogram(bins: &[AtomicU64; HISTOGRAM_BINS]) -> [u64; HISTOGRAM_BINS] {
    std::array::from_fn(|i| take(&bins[i]))
}

impl LogStatistics {
    pub(crate) fn new(timings: bool) -> Self {
        Self {
            timings,
            ..Self::default()
        }
    }

    pub(crate) fn timer(&self) -> StageTimer<'_> {
        StageTimer {
            stats: self,
            last: self.timings.then(Instant::now),
        }
    }

    fn add_time(&self, stage: Stage, nanos: u64) {
        let counter = match stage {
            Stage::WriteStalled => &self.write_stalled_ns,
            Stage::WriteCopying => &self.write_copying_ns,
            Stage::WriteUpdateState => &self.write_update_state_ns,
            Stage::PaddingStalled => &self.padding_stalled_ns,
            Stage::FlushHelperWaiting => &self.flush_helper_waiting_ns,
            Stage::Flushing => &self.flushing_ns,
            Stage::FlushOther => &self.flush_other_ns,
        };
        bump(counter, nanos);
    }

    pub(crate) fn record_flush_request(&self) {
        bump(&self.flush_requests, 1);
    }

    pub(crate) fn record_full_buffer(&self) {
        bump(&self.threads_finding_full_buffers, 1);
    }

    pub(crate) fn record_flush_helper_wait(&self) {
        bump(&self.flush_helper_waits, 1);
    }

    pub(crate) fn record_cycle(&self) {
        bump(&self.log_cycles, 1);
    }

    pub(crate) fn record_checkpoint_triggered(&self) {
        bump(&self.checkpoints_triggered, 1);
    }

    pub(crate) fn record_multi_part_stall(&self) {
        bump(&self.stalled_for_multi_part_id, 1);
    }

    pub(crate) fn record_padding(&self, bytes: u64) {
        bump(&self.padding_bytes, bytes);
        bump(&self.padding_records, 1);
    }

    pub(crate) fn record_write(&self, pages: u64, bytes: u64) {
        bump(&self.log_buffer_writes, 1);
        bump(&self.bytes_written, bytes);
        bump(&self.pages_written[bin(pages)], 1);
    }

    pub(crate) fn record_flush_waiters(&self, waiters: u64) {
        bump(&self.flush_waiters[bin(waiters)], 1);
    }

    pub(crate) fn capture(&self, gauges: SpaceGauges) -> StatsSnapshot {
        StatsSnapshot {
            bytes_written: take(&self.bytes_written),
            flush_requests: take(&self.flush_requests),
            log_buffer_writes: take(&self.log_buffer_writes),
            threads_finding_full_buffers: take(&self.threads_finding_full_buffers),
            flush_helper_waits: take(&self.flush_helper_waits),
            log_cycles: take(&self.log_cycles),
            checkpoints_triggered: take(&self.checkpoints_triggered),
            stalled_for_multi_part_id: take(&self.stalled_for_multi_part_id),
            padding_bytes: take(&self.padding_bytes),
            padding_records: take(&self.padding_records),
            write_stalled_ms: take(&self.write_stalled_ns) / 1_000_000,
            write_copying_ms: take(&self.write_copying_ns) / 1_000_000,
            write_update_state_ms: take(&self.write_update_state_ns) / 1_000_000,
            padding_stalled_ms: take(&self.padding_stalled_ns) / 1_000_000,
            flush_helper_waiting_ms: take(&self.flush_helper_waiting_ns) / 1_000_000,
            flushing_ms: take(&self.flushing_ns) / 1_000_000,
            flush_other_ms: take(&self.flush_other_ns) / 1_000_000,
            flush_waiters_histogram: take_histogram(&self.flush_waiters),
            pages_written_histogram: take_histogram(&self.pages_written),
            gauges,
        }
    }
}

/// Point-in-time space figures reported alongside the counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SpaceGauges {
    /// Free bytes in the space shards.
    pub space_left: i64,
    /// Bytes held by the padding pool.
    pub padding_available: i64,
    /// Current padding pool target.
    pub padding_target: i64,
    /// Current file size.
    pub file_size: u64,
    /// Unchecked bytes appended since the mark point.
    pub unchecked_bytes: u64,
    /// Unchecked bytes between the log start and the mark point.
    pub unchecked_bytes_up_to_mark: u64,
    /// Pages in the current log buffer.
    pub buffer_pages: u64,
}

/// Counters collected since the previous capture.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    /// Bytes handed to the file.
    pub bytes_written: u64,
    /// Waits for a page to reach disk.
    pub flush_requests: u64,
    /// Batch writes issued by the flush helper.
    pub log_buffer_writes: u64,
    /// Appends that found the buffer full and had to flush first.
    pub threads_finding_full_buffers: u64,
    /// Times the flush helper went idle.
    pub flush_helper_waits: u64,
    /// Passes over the end of the file.
    pub log_cycles: u64,
    /// Checkpoint suggestions sent to the authority.
    pub checkpoints_triggered: u64,
    /// Times an append waited for a free multi-part id.
    pub stalled_for_multi_part_id: u64,
    /// Bytes of padding written.
    pub padding_bytes: u64,
    /// Padding operations performed.
    pub padding_records: u64,
    /// Time producers waited for the buffer lock.
    pub write_stalled_ms: u64,
    /// Time producers spent copying bytes.
    pub write_copying_ms: u64,
    /// Time producers spent publishing page state.
    pub write_update_state_ms: u64,
    /// Time the flush helper waited for the buffer lock to pad.
    pub padding_stalled_ms: u64,
    /// Time the flush helper sat idle.
    pub flush_helper_waiting_ms: u64,
    /// Time spent in batch writes.
    pub flushing_ms: u64,
    /// Remaining flush helper time.
    pub flush_other_ms: u64,
    /// Waiters woken per notified page.
    pub flush_waiters_histogram: [u64; HISTOGRAM_BINS],
    /// Pages per batch write.
    pub pages_written_histogram: [u64; HISTOGRAM_BINS],
    /// Space figures at capture time.
    pub gauges: SpaceGauges,
}

impl StatsSnapshot {
    /// Flattens the snapshot into key/value strings.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let counters = [
            ("bytes_written", self.bytes_written),
            ("flush_requests", self.flush_requests),
            ("log_buffer_writes", self.log_buffer_writes),
            ("threads_finding_full_buffers", self.threads_finding_full_buffers),
            ("flush_helper_waits", self.flush_helper_waits),
            ("log_cycles", self.log_cycles),
            ("checkpoints_triggered", self.checkpoints_triggered),
            ("stalled_for_multi_part_id", self.stalled_for_multi_part_id),
            ("padding_bytes", self.padding_bytes),
            ("padding_records", self.padding_records),
            ("write_stalled_ms", self.write_stalled_ms),
            ("write_copying_ms", self.write_copying_ms),
            ("write_update_state_ms", self.write_update_state_ms),
            ("padding_stalled_ms", self.padding_stalled_ms),
            ("flush_helper_waiting_ms", self.flush_helper_waiting_ms),
            ("flushing_ms", self.flushing_ms),
            ("flush_other_ms", self.flush_other_ms),
            ("file_size", self.gauges.file_size),
            ("unchecked_bytes", self.gauges.unchecked_bytes),
            ("unchecked_bytes_up_to_mark", self.gauges.unchecked_bytes_up_to_mark),
            ("buffer_pages", self.gauges.buffer_pages),
        ];
        let mut map: BTreeMap<String, String> = counters
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        map.insert("space_left".into(), self.gauges.space_left.to_string());
        map.insert(
            "padding_available".into(),
            self.gauges.padding_available.to_string(),
        );
        map.insert("padding_target".into(), self.gauges.padding_target.to_string());
        map.insert(
            "flush_waiters_histogram".into(),
            render_histogram(&self.flush_waiters_histogram),
        );
        map.insert(
            "pages_written_histogram".into(),
            render_histogram(&self.pages_written_histogram),
        );
        map
    }
}

fn render_histogram(bins: &[u64; HISTOGRAM_BINS]) -> String {
    let body: Vec<String> = bins.iter().map(u64::to_string).collect();
    format!("(0-15 >15) {}", body.join(" "))
}
