#![allow(missing_docs)]

use std::sync::Arc;

use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{LogOptions, LogScanner, LogWriter, NoopAuthority, PAGE_SIZE};
use ringwal::types::{Result, WalError};
use tempfile::tempdir;

const PAGE: u64 = PAGE_SIZE as u64;

fn options(file_pages: u64) -> LogOptions {
    LogOptions {
        file_size: file_pages * PAGE,
        initial_buffer_pages: 4,
        max_buffer_pages: 4,
        padding_minimum_pages: 1,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    }
}

fn create(path: &std::path::Path, file_pages: u64) -> Result<(LogWriter, Arc<dyn FileIo>)> {
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
    let writer = LogWriter::create(io.clone(), options(file_pages), Arc::new(NoopAuthority))?;
    Ok((writer, io))
}

#[test]
fn grow_extends_the_file_and_the_space() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(&dir.path().join("grow.log"), 33)?;
    for n in 0..3u8 {
        writer.append_bytes(vec![n; 2000], true)?;
    }
    let before = writer.space_left();

    writer.set_file_size(65 * PAGE)?;
    assert_eq!(writer.file_size(), 65 * PAGE);
    assert_eq!(writer.requested_file_size(), 65 * PAGE);
    assert_eq!(io.len()?, 65 * PAGE);
    assert_eq!(writer.header().file_size, 65 * PAGE);
    assert!(writer.space_left() > before);

    // Forty single-page records run well past the old end of the file.
    for n in 0..40u8 {
        writer.append_bytes(vec![100 + n; 4000], true)?;
    }
    let snapshot = writer.buffer_snapshot();
    assert!(snapshot.buffer_file_position > 33 * PAGE);
    writer.close()?;

    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 43);
    assert!(!scan.cycled);
    assert!(scan.records[42].address > 33 * PAGE);
    assert_eq!(scan.records[42].payload[0], 139);
    Ok(())
}

#[test]
fn shrink_cuts_the_file_when_data_fits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(&dir.path().join("shrink.log"), 65)?;
    writer.append_bytes(vec![1u8; 500], false)?;
    writer.append_bytes(vec![2u8; 500], true)?;
    let before = writer.space_left();

    // Not page aligned; rounds down to 33 pages.
    writer.set_file_size(33 * PAGE + 100)?;
    assert_eq!(writer.file_size(), 33 * PAGE);
    assert_eq!(io.len()?, 33 * PAGE);
    assert!(writer.space_left() < before);

    writer.append_bytes(vec![3u8; 500], true)?;
    writer.close()?;
    let scanner = LogScanner::open(io)?;
    assert_eq!(scanner.header().file_size, 33 * PAGE);
    let scan = scanner.scan()?;
    let firsts: Vec<u8> = scan.records.iter().map(|r| r.payload[0]).collect();
    assert_eq!(firsts, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn shrink_refused_when_live_data_would_not_fit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(&dir.path().join("full.log"), 65)?;
    for _ in 0..10 {
        writer.append_bytes(vec![9u8; 15_000], false)?;
    }
    writer.flush()?;

    let err = writer.set_file_size(33 * PAGE).unwrap_err();
    match &err {
        WalError::FileSizeTooSmall {
            requested,
            occupancy,
            threshold,
        } => {
            assert_eq!(*requested, 33 * PAGE);
            assert!(occupancy > threshold);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_recoverable());
    assert_eq!(writer.requested_file_size(), 65 * PAGE);
    assert_eq!(writer.file_size(), 65 * PAGE);
    assert_eq!(io.len()?, 65 * PAGE);

    // The writer keeps working after the refusal.
    writer.append_bytes(vec![1u8; 10], true)?;
    writer.close()?;
    Ok(())
}

#[test]
fn sizes_below_twice_the_buffer_are_invalid() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, _io) = create(&dir.path().join("tiny.log"), 33)?;
    assert!(matches!(
        writer.set_file_size(8 * PAGE),
        Err(WalError::Invalid(_))
    ));
    assert_eq!(writer.file_size(), 33 * PAGE);
    // Resizing to the current size is a no-op.
    writer.set_file_size(33 * PAGE)?;
    writer.close()?;
    Ok(())
}
