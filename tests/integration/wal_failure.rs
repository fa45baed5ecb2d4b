#![allow(missing_docs)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{CheckpointAuthority, LogOptions, LogWriter, PAGE_SIZE};
use ringwal::types::{Result, WalError};
use tempfile::tempdir;

/// File wrapper that starts failing writes or truncations on request.
struct FailingIo {
    inner: StdFileIo,
    fail_writes: AtomicBool,
    fail_truncate: AtomicBool,
}

impl FailingIo {
    fn new(inner: StdFileIo) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_truncate: AtomicBool::new(false),
        }
    }
}

fn injected(what: &str) -> WalError {
    WalError::Io(io::Error::other(format!("injected {what} failure")))
}

impl FileIo for FailingIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if self.fail_truncate.load(Ordering::SeqCst) {
            return Err(injected("truncate"));
        }
        self.inner.truncate(len)
    }
}

#[derive(Default)]
struct ShutdownRecorder {
    requests: AtomicU64,
    cause: Mutex<Option<String>>,
}

impl CheckpointAuthority for ShutdownRecorder {
    fn request_shutdown(&self, cause: &WalError) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.cause.lock() = Some(cause.to_string());
    }
}

fn options() -> LogOptions {
    LogOptions {
        file_size: 33 * PAGE_SIZE as u64,
        initial_buffer_pages: 4,
        max_buffer_pages: 4,
        padding_minimum_pages: 1,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    }
}

#[test]
fn write_failure_terminates_the_log() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let io = Arc::new(FailingIo::new(StdFileIo::open(dir.path().join("fail.log"))?));
    let authority = Arc::new(ShutdownRecorder::default());
    let writer = LogWriter::create(io.clone(), options(), authority.clone())?;
    writer.append_bytes(vec![1u8; 100], true)?;

    io.fail_writes.store(true, Ordering::SeqCst);
    match writer.append_bytes(vec![2u8; 100], true) {
        Err(WalError::Terminated { thread, cause }) => {
            assert_eq!(thread, "flush helper");
            assert!(matches!(*cause, WalError::Io(_)));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(authority.requests.load(Ordering::SeqCst), 1);
    let cause = authority.cause.lock().clone().expect("cause recorded");
    assert!(cause.contains("injected write failure"));

    // Every later operation reports the same cause.
    assert!(matches!(
        writer.append_bytes(vec![3u8; 10], false),
        Err(WalError::Terminated { .. })
    ));
    assert!(matches!(writer.flush(), Err(WalError::Terminated { .. })));
    assert!(matches!(writer.reserve(10), Err(WalError::Terminated { .. })));
    assert!(matches!(
        writer.set_file_size(65 * PAGE_SIZE as u64),
        Err(WalError::Terminated { .. })
    ));

    // Shutting down a failed log is clean and idempotent.
    writer.close()?;
    writer.close()?;
    assert_eq!(authority.requests.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn failed_grow_is_reported_and_the_log_keeps_running() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let io = Arc::new(FailingIo::new(StdFileIo::open(dir.path().join("grow.log"))?));
    let authority = Arc::new(ShutdownRecorder::default());
    let writer = LogWriter::create(io.clone(), options(), authority.clone())?;
    writer.append_bytes(vec![1u8; 100], true)?;

    io.fail_truncate.store(true, Ordering::SeqCst);
    assert!(matches!(
        writer.set_file_size(65 * PAGE_SIZE as u64),
        Err(WalError::Io(_))
    ));
    assert_eq!(writer.file_size(), 33 * PAGE_SIZE as u64);
    assert_eq!(writer.requested_file_size(), 33 * PAGE_SIZE as u64);

    io.fail_truncate.store(false, Ordering::SeqCst);
    writer.append_bytes(vec![2u8; 100], true)?;
    writer.set_file_size(65 * PAGE_SIZE as u64)?;
    assert_eq!(io.len()?, 65 * PAGE_SIZE as u64);
    assert_eq!(authority.requests.load(Ordering::SeqCst), 0);
    writer.close()?;
    Ok(())
}
