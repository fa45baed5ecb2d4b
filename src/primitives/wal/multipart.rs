use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::Result;

use super::lifecycle::FailureState;
use super::stats::LogStatistics;
use super::MULTI_PART_IDS;

const LEASE_RETRY: Duration = Duration::from_millis(10);

/// Pool of the ids that tie the parts of a long record together.
#[derive(Debug)]
pub(crate) struct MultiPartIds {
    in_use: Mutex<[bool; MULTI_PART_IDS]>,
}

/// A leased id, returned to the pool on drop.
#[derive(Debug)]
pub(crate) struct MultiPartLease<'a> {
    ids: &'a MultiPartIds,
    id: u8,
}

impl MultiPartLease<'_> {
    pub(crate) fn id(&self) -> u8 {
        self.id
    }
}

impl Drop for MultiPartLease<'_> {
    fn drop(&mut self) {
        self.ids.in_use.lock()[self.id as usize] = false;
    }
}

impl MultiPartIds {
    pub(crate) fn new() -> Self {
        let mut in_use = [false; MULTI_PART_IDS];
        // Id 0 marks single-part records.
        in_use[0] = true;
        Self {
            in_use: Mutex::new(in_use),
        }
    }

    pub(crate) fn try_lease(&self) -> Option<MultiPartLease<'_>> {
        let mut in_use = self.in_use.lock();
        let id = in_use.iter().position(|used| !used)?;
        in_use[id] = true;
        Some(MultiPartLease {
            ids: self,
            id: id as u8,
        })
    }

    /// Leases an id, sleeping briefly while all are taken.
    pub(crate) fn lease(
        &self,
        failure: &FailureState,
        stats: &LogStatistics,
    ) -> Result<MultiPartLease<'_>> {
        loop {
            if let Some(lease) = self.try_lease() {
                return Ok(lease);
            }
            failure.check()?;
            stats.record_multi_part_stall();
            debug!("wal.writer.multipart_stall");
            thread::sleep(LEASE_RETRY);
        }
    }

    #[cfg(test)]
    fn leased(&self) -> usize {
        self.in_use.lock().iter().skip(1).filter(|used| **used).count()
    }
}
