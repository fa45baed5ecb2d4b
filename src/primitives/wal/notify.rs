//! The notify helper: wakes producers whose pages reached the disk, so the
//! flush helper never spends time on wakeups.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::types::Result;

use super::buffer::LogBuffer;
use super::writer::LogShared;

pub(crate) const NOTIFY_HELPER: &str = "notify helper";

pub(crate) struct NotifyWorker {
    shared: Arc<LogShared>,
    /// Buffer holding `next_page_to_notify`.
    buffer: Arc<LogBuffer>,
}

impl NotifyWorker {
    pub(crate) fn new(shared: Arc<LogShared>, buffer: Arc<LogBuffer>) -> Self {
        Self { shared, buffer }
    }

    pub(crate) fn run(mut self) {
        debug!("wal.notify.start");
        if let Err(err) = self.run_loop() {
            self.shared.abnormal_termination(NOTIFY_HELPER, err);
        }
        debug!("wal.notify.exit");
    }

    fn run_loop(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let control = &shared.notify_helper;
        loop {
            let requested = {
                let mut state = control.state.lock();
                loop {
                    if shared.cursors.next_page_to_notify() != state.requested_page {
                        break state.requested_page;
                    }
                    if !state.running {
                        return Ok(());
                    }
                    state.waiting = true;
                    control.wakeup.wait(&mut state);
                    state.waiting = false;
                }
            };

            while shared.cursors.next_page_to_notify() != requested {
                self.notify_page(shared.cursors.next_page_to_notify());
            }

            // A producer may already be waiting on the page now at the head.
            let next = shared.cursors.next_page_to_notify();
            if self.buffer.page(next).has_waiter() {
                if let Err(err) = shared.flush_helper.signal(&shared.failure) {
                    debug!(error = %err, "wal.notify.flush_signal_skipped");
                }
            }
        }
    }

    fn notify_page(&mut self, page: usize) {
        let shared = &self.shared;
        let slot = self.buffer.page(page);
        {
            let mut wait = slot.wait.lock();
            slot.state.lock().flush_pending = false;
            if slot.waiter_exists.swap(false, Ordering::SeqCst) {
                slot.release_waiters(&mut wait);
            }
            shared.stats.record_flush_waiters(wait.waiters);
            wait.waiters = 0;
        }
        shared.cursors.last_page_notified.store(page, Ordering::SeqCst);

        let mut next = page + 1;
        if next == self.buffer.number_of_pages() {
            next = 0;
            let mut state = shared.buffer.lock();
            if !Arc::ptr_eq(&self.buffer, &state.current) {
                self.buffer = Arc::clone(&state.current);
                state.new_buffer_pages = 0;
                state.draining = None;
                debug!(
                    pages = self.buffer.number_of_pages(),
                    "wal.notify.switch_buffer"
                );
            }
        }
        shared.cursors.next_page_to_notify.store(next, Ordering::SeqCst);
    }
}
