//! Helper-thread signalling and the shared failure channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, WalError};

#[derive(Debug)]
enum Termination {
    Shutdown,
    Abnormal {
        thread: &'static str,
        cause: Arc<WalError>,
    },
}

/// Records why the log stopped. Once set, every operation fails with it.
#[derive(Debug, Default)]
pub(crate) struct FailureState {
    stopped: AtomicBool,
    termination: Mutex<Option<Termination>>,
}

impl FailureState {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if !self.is_stopped() {
            return Ok(());
        }
        match &*self.termination.lock() {
            Some(Termination::Abnormal { thread, cause }) => Err(WalError::Terminated {
                thread: *thread,
                cause: Arc::clone(cause),
            }),
            _ => Err(WalError::ThreadNotRunning("log writer")),
        }
    }

    /// Stores the first abnormal cause; later ones are dropped.
    pub(crate) fn record_abnormal(&self, thread: &'static str, cause: WalError) -> Arc<WalError> {
        let mut termination = self.termination.lock();
        let stored = if let Some(Termination::Abnormal { cause: first, .. }) = termination.as_ref()
        {
            Arc::clone(first)
        } else {
            let cause = Arc::new(cause);
            *termination = Some(Termination::Abnormal {
                thread,
                cause: Arc::clone(&cause),
            });
            cause
        };
        self.stopped.store(true, Ordering::SeqCst);
        stored
    }

    pub(crate) fn record_shutdown(&self) {
        let mut termination = self.termination.lock();
        if termination.is_none() {
            *termination = Some(Termination::Shutdown);
        }
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct HelperState {
    pub(crate) running: bool,
    pub(crate) waiting: bool,
    /// Notify helper only: notify every page before this index.
    pub(crate) requested_page: usize,
}

/// Wait/wake pair for one helper thread.
#[derive(Debug)]
pub(crate) struct HelperControl {
    pub(crate) name: &'static str,
    pub(crate) state: Mutex<HelperState>,
    pub(crate) wakeup: Condvar,
    /// Set while the helper is doing work rather than waiting.
    pub(crate) active: AtomicBool,
}

impl HelperControl {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(HelperState {
                running: true,
                waiting: false,
                requested_page: 0,
            }),
            wakeup: Condvar::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Wakes the helper if it is idle. Never blocks on the helper's work.
    pub(crate) fn signal(&self, failure: &FailureState) -> Result<()> {
        failure.check()?;
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.lock();
        if !state.running {
            return Err(WalError::ThreadNotRunning(self.name));
        }
        if state.waiting {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// Asks the notify helper to advance up to `page`.
    pub(crate) fn request_page(&self, page: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(WalError::ThreadNotRunning(self.name));
        }
        state.requested_page = page;
        if state.waiting {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.wakeup.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }
}
