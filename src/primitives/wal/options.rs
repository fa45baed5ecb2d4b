use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Result, WalError};

use super::{HEADER_REGION_LEN, PAGE_SIZE};

/// Smallest buffer that still leaves room for a gap page and a whole part.
pub const MIN_BUFFER_PAGES: usize = 3;

/// Tuning for a log writer. Every field has a default, so a TOML file only
/// needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Size used when creating a new log file, rounded down to a page.
    pub file_size: u64,
    /// Pages in the first log buffer.
    pub initial_buffer_pages: usize,
    /// Upper bound for buffer growth.
    pub max_buffer_pages: usize,
    /// Floor of the padding reserve, in pages.
    pub padding_minimum_pages: u64,
    /// Occupancy above which a checkpoint is suggested after each flush.
    pub checkpoint_threshold: f32,
    /// Occupancy above which the log is flagged high. Also the ceiling a
    /// resize may produce.
    pub occupancy_high_threshold: f32,
    /// Sync the file after every batch write.
    pub sync_on_flush: bool,
    /// Record timing counters.
    pub gather_statistics: bool,
    /// Longest the flush helper sleeps before re-checking for work.
    pub flush_idle_wait_ms: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            file_size: 10 * 1024 * 1024,
            initial_buffer_pages: 16,
            max_buffer_pages: 256,
            padding_minimum_pages: 10,
            checkpoint_threshold: 0.75,
            occupancy_high_threshold: 0.90,
            sync_on_flush: true,
            gather_statistics: true,
            flush_idle_wait_ms: 100,
        }
    }
}

impl LogOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: LogOptions =
            toml::from_str(text).map_err(|err| WalError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| WalError::Config(err.to_string()))
    }

    /// Rejects combinations the writer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.initial_buffer_pages < MIN_BUFFER_PAGES {
            return Err(WalError::Invalid("initial_buffer_pages must be at least 3"));
        }
        if self.max_buffer_pages < self.initial_buffer_pages {
            return Err(WalError::Invalid(
                "max_buffer_pages must not be below initial_buffer_pages",
            ));
        }
        if !(0.0..=1.0).contains(&self.checkpoint_threshold)
            || !(0.0..=1.0).contains(&self.occupancy_high_threshold)
        {
            return Err(WalError::Invalid("occupancy thresholds must lie in 0..=1"));
        }
        if self.checkpoint_threshold > self.occupancy_high_threshold {
            return Err(WalError::Invalid(
                "checkpoint_threshold must not exceed occupancy_high_threshold",
            ));
        }
        if self.padding_minimum_pages == 0 {
            return Err(WalError::Invalid("padding_minimum_pages must be positive"));
        }
        if self.flush_idle_wait_ms == 0 {
            return Err(WalError::Invalid("flush_idle_wait_ms must be positive"));
        }
        Ok(())
    }

    /// Creation size rounded down to whole pages, checked against the buffer.
    pub fn creation_file_size(&self) -> Result<u64> {
        let size = self.file_size - self.file_size % PAGE_SIZE as u64;
        check_file_size(size, self.initial_buffer_pages)?;
        Ok(size)
    }

    pub(crate) fn flush_idle_wait(&self) -> Duration {
        Duration::from_millis(self.flush_idle_wait_ms)
    }
}

/// A log buffer may cover at most half of the data region.
pub(crate) fn check_file_size(file_size: u64, buffer_pages: usize) -> Result<()> {
    if file_size % PAGE_SIZE as u64 != 0 {
        return Err(WalError::Invalid("log file size must be a multiple of the page size"));
    }
    let data_pages = file_size.saturating_sub(HEADER_REGION_LEN) / PAGE_SIZE as u64;
    if data_pages < 2 * buffer_pages as u64 {
        return Err(WalError::Invalid(
            "log file must hold at least twice the log buffer",
        ));
    }
    Ok(())
}
