//! The in-memory page window and its per-page state.
//!
//! Page life cycle: idle, filling (`writers_active > 0`), flush pending,
//! flushed (waiters woken by the notify helper), idle again. Cursor updates
//! happen under the buffer lock; page state changes under the page's own
//! state lock; waiters block on the separate wait lock so they never contend
//! with producers publishing state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::sector;
use super::{HEADER_REGION_LEN, MULTI_PART_IDS, PAGE_SIZE};

#[derive(Debug, Default)]
pub(crate) struct PageState {
    pub(crate) flush_pending: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PageWait {
    /// Bumped every time the page's waiters are released.
    pub(crate) generation: u64,
    /// Waiters since the last release.
    pub(crate) waiters: u64,
}

/// One page of the buffer plus its transient state.
#[derive(Debug)]
pub(crate) struct PageSlot {
    pub(crate) data: Mutex<Box<[u8]>>,
    pub(crate) writers_active: AtomicU32,
    pub(crate) waiter_exists: AtomicBool,
    pub(crate) state: Mutex<PageState>,
    pub(crate) wait: Mutex<PageWait>,
    pub(crate) flushed: Condvar,
}

impl PageSlot {
    fn new() -> Self {
        Self {
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            writers_active: AtomicU32::new(0),
            waiter_exists: AtomicBool::new(false),
            state: Mutex::new(PageState::default()),
            wait: Mutex::new(PageWait::default()),
            flushed: Condvar::new(),
        }
    }

    pub(crate) fn writers(&self) -> u32 {
        self.writers_active.load(Ordering::SeqCst)
    }

    pub(crate) fn has_waiter(&self) -> bool {
        self.waiter_exists.load(Ordering::SeqCst)
    }

    pub(crate) fn flush_pending(&self) -> bool {
        self.state.lock().flush_pending
    }

    /// Releases everyone blocked on this page.
    pub(crate) fn release_waiters(&self, wait: &mut MutexGuard<'_, PageWait>) {
        wait.generation = wait.generation.wrapping_add(1);
        self.flushed.notify_all();
    }
}

/// A ring of pages acting as a sliding window over the log file.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    pages: Box<[PageSlot]>,
}

impl LogBuffer {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            pages: (0..pages).map(|_| PageSlot::new()).collect(),
        }
    }

    pub(crate) fn number_of_pages(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn len_bytes(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub(crate) fn page(&self, index: usize) -> &PageSlot {
        &self.pages[index]
    }

    /// Wakes every waiter regardless of flush state. Used when the log stops.
    pub(crate) fn wake_all(&self) {
        for slot in self.pages.iter() {
            let mut wait = slot.wait.lock();
            slot.release_waiters(&mut wait);
        }
    }
}

/// Cursors read outside the buffer lock.
#[derive(Debug)]
pub(crate) struct Cursors {
    /// Owned by the flush helper.
    pub(crate) first_page_to_flush: AtomicUsize,
    /// Owned by the notify helper.
    pub(crate) last_page_notified: AtomicUsize,
    /// Owned by the notify helper.
    pub(crate) next_page_to_notify: AtomicUsize,
    /// Advanced by whichever producer drains the page's last writer.
    pub(crate) first_page_filling: AtomicUsize,
    /// Written under the buffer lock.
    pub(crate) last_page_filling: AtomicUsize,
}

impl Cursors {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            first_page_to_flush: AtomicUsize::new(0),
            last_page_notified: AtomicUsize::new(pages - 1),
            next_page_to_notify: AtomicUsize::new(0),
            first_page_filling: AtomicUsize::new(0),
            last_page_filling: AtomicUsize::new(0),
        }
    }

    pub(crate) fn first_page_to_flush(&self) -> usize {
        self.first_page_to_flush.load(Ordering::SeqCst)
    }

    pub(crate) fn last_page_notified(&self) -> usize {
        self.last_page_notified.load(Ordering::SeqCst)
    }

    pub(crate) fn next_page_to_notify(&self) -> usize {
        self.next_page_to_notify.load(Ordering::SeqCst)
    }

    pub(crate) fn first_page_filling(&self) -> usize {
        self.first_page_filling.load(Ordering::SeqCst)
    }

    pub(crate) fn last_page_filling(&self) -> usize {
        self.last_page_filling.load(Ordering::SeqCst)
    }
}

/// Where an in-flight multi-part record began.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MultiPartStart {
    pub(crate) address: u64,
    pub(crate) sector_byte: u8,
    pub(crate) unchecked_total: u64,
}

/// State guarded by the buffer lock.
#[derive(Debug)]
pub(crate) struct BufferState {
    /// Buffer producers are filling.
    pub(crate) current: Arc<LogBuffer>,
    /// Previous buffer, kept until the notify helper has moved past it.
    pub(crate) draining: Option<Arc<LogBuffer>>,
    pub(crate) sequence_of_first_page: u64,
    pub(crate) next_free_byte: usize,
    /// Non-zero once a producer found the buffer full; applied at the next wrap.
    pub(crate) new_buffer_pages: usize,
    /// File address of page 0 of `current`.
    pub(crate) buffer_file_position: u64,
    pub(crate) buffer_sector_byte: u8,
    pub(crate) file_mark: u64,
    pub(crate) file_mark_sector_byte: u8,
    /// Unchecked bytes appended before the mark point, counted from open.
    pub(crate) file_mark_unchecked: u64,
    /// Unchecked bytes appended since open.
    pub(crate) unchecked_total: u64,
    /// Unchecked bytes already behind the log start.
    pub(crate) truncated_unchecked: u64,
    pub(crate) multi_part_starts: [Option<MultiPartStart>; MULTI_PART_IDS],
}

impl BufferState {
    pub(crate) fn new(
        buffer: Arc<LogBuffer>,
        first_sequence: u64,
        file_position: u64,
        sector_byte: u8,
        start: u64,
        start_sector_byte: u8,
    ) -> Self {
        Self {
            current: buffer,
            draining: None,
            sequence_of_first_page: first_sequence,
            next_free_byte: 1,
            new_buffer_pages: 0,
            buffer_file_position: file_position,
            buffer_sector_byte: sector_byte,
            file_mark: start,
            file_mark_sector_byte: start_sector_byte,
            file_mark_unchecked: 0,
            unchecked_total: 0,
            truncated_unchecked: 0,
            multi_part_starts: [None; MULTI_PART_IDS],
        }
    }

    /// Moves the window one buffer length forward after `next_free_byte`
    /// wrapped. Swaps in a larger buffer when one was requested and returns
    /// its page count.
    pub(crate) fn wrap_window(&mut self, file_size: u64) -> Option<usize> {
        let old_pages = self.current.number_of_pages();
        let old_len = self.current.len_bytes() as u64;
        self.sequence_of_first_page += old_pages as u64;
        let resized = if self.new_buffer_pages != 0 && self.draining.is_none() {
            let next = Arc::new(LogBuffer::new(self.new_buffer_pages));
            self.draining = Some(std::mem::replace(&mut self.current, next));
            Some(self.new_buffer_pages)
        } else {
            None
        };
        self.buffer_file_position += old_len;
        if self.buffer_file_position >= file_size {
            self.buffer_sector_byte = sector::flip(self.buffer_sector_byte);
            self.buffer_file_position = self.buffer_file_position - file_size + HEADER_REGION_LEN;
        }
        resized
    }

    /// Every buffer still reachable by a waiter.
    pub(crate) fn live_buffers(&self) -> Vec<Arc<LogBuffer>> {
        let mut buffers = vec![Arc::clone(&self.current)];
        if let Some(draining) = &self.draining {
            buffers.push(Arc::clone(draining));
        }
        buffers
    }
}

/// Copies a byte stream into pages starting at a buffer offset, skipping each
/// page's sector byte and continuing in `next` after the end of `buffer`.
pub(crate) struct PageWriter<'a> {
    buffer: &'a LogBuffer,
    next: &'a LogBuffer,
    offset: usize,
}

impl<'a> PageWriter<'a> {
    pub(crate) fn new(buffer: &'a LogBuffer, next: &'a LogBuffer, offset: usize) -> Self {
        Self {
            buffer,
            next,
            offset,
        }
    }

    /// Writes `len` bytes produced by `fill`, which is handed one
    /// destination slice per page.
    pub(crate) fn write_with(&mut self, mut len: usize, mut fill: impl FnMut(&mut [u8])) {
        while len > 0 {
            if self.offset >= self.buffer.len_bytes() {
                self.buffer = self.next;
                self.offset = 0;
            }
            if self.offset % PAGE_SIZE == 0 {
                self.offset += 1;
            }
            let page = self.offset / PAGE_SIZE;
            let in_page = self.offset % PAGE_SIZE;
            let n = len.min(PAGE_SIZE - in_page);
            {
                let mut data = self.buffer.page(page).data.lock();
                fill(&mut data[in_page..in_page + n]);
            }
            self.offset += n;
            len -= n;
        }
    }

    pub(crate) fn write_bytes(&mut self, src: &[u8]) {
        let mut consumed = 0;
        self.write_with(src.len(), |dst| {
            dst.copy_from_slice(&src[consumed..consumed + dst.len()]);
            consumed += dst.len();
        });
    }
}

/// Per-page view returned by `LogWriter::buffer_snapshot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSnapshot {
    /// Producers still copying into the page.
    pub writers_active: u32,
    /// The page is complete and waiting for the flush helper.
    pub flush_pending: bool,
    /// A producer is blocked until the page is on disk.
    pub waiter_exists: bool,
}

/// Diagnostic view of the page window.
#[derive(Clone, Debug)]
pub struct BufferSnapshot {
    /// Sequence number of page 0.
    pub sequence_of_first_page: u64,
    /// File address of page 0.
    pub buffer_file_position: u64,
    /// Next file address the flush helper will write.
    pub file_position: u64,
    /// Next byte a producer will reserve.
    pub next_free_byte: usize,
    /// Pending growth request, 0 when none.
    pub new_buffer_pages: usize,
    /// First page the flush helper has not written.
    pub first_page_to_flush: usize,
    /// Last page whose waiters were woken.
    pub last_page_notified: usize,
    /// Next page the notify helper will visit.
    pub next_page_to_notify: usize,
    /// Oldest page still being filled.
    pub first_page_filling: usize,
    /// Page holding `next_free_byte`.
    pub last_page_filling: usize,
    /// True while an older buffer is still draining.
    pub draining: bool,
    /// Per-page state of the current buffer.
    pub pages: Vec<PageSnapshot>,
}

impl BufferSnapshot {
    pub(crate) fn capture(state: &BufferState, cursors: &Cursors, file_position: u64) -> Self {
        let pages = (0..state.current.number_of_pages())
            .map(|i| {
                let slot = state.current.page(i);
                PageSnapshot {
                    writers_active: slot.writers(),
                    flush_pending: slot.flush_pending(),
                    waiter_exists: slot.has_waiter(),
                }
            })
            .collect();
        Self {
            sequence_of_first_page: state.sequence_of_first_page,
            buffer_file_position: state.buffer_file_position,
            file_position,
            next_free_byte: state.next_free_byte,
            new_buffer_pages: state.new_buffer_pages,
            first_page_to_flush: cursors.first_page_to_flush(),
            last_page_notified: cursors.last_page_notified(),
            next_page_to_notify: cursors.next_page_to_notify(),
            first_page_filling: cursors.first_page_filling(),
            last_page_filling: cursors.last_page_filling(),
            draining: state.draining.is_some(),
            pages,
        }
    }

    /// Total writers still registered on any page.
    pub fn writers_active(&self) -> u32 {
        self.pages.iter().map(|p| p.writers_active).sum()
    }
}
