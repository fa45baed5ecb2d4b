#![allow(missing_docs)]

use std::sync::Arc;

use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{LogOptions, LogScanner, LogWriter, NoopAuthority, PAGE_SIZE};
use ringwal::types::Result;
use tempfile::tempdir;

fn ring_options(file_pages: u64) -> LogOptions {
    LogOptions {
        file_size: file_pages * PAGE_SIZE as u64,
        initial_buffer_pages: 3,
        max_buffer_pages: 3,
        padding_minimum_pages: 1,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    }
}

fn numbered(round: u32, len: usize) -> Vec<u8> {
    let mut payload = vec![(round % 251) as u8; len];
    payload[..4].copy_from_slice(&round.to_le_bytes());
    payload
}

#[test]
fn marked_appends_cycle_the_file_many_times() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("ring.log"))?);
    let writer = LogWriter::create(io.clone(), ring_options(7), Arc::new(NoopAuthority))?;
    let space_at_start = writer.space_left();

    let rounds = 20u32;
    let mut last_sequence = 0;
    for round in 0..rounds {
        let sequence = writer.append_and_mark_bytes(numbered(round, 1000), true)?;
        assert!(sequence > last_sequence);
        last_sequence = sequence;
        writer.truncate()?;
        assert_eq!(writer.header().start_byte_address, writer.mark_point().address);
    }

    let stats = writer.capture_statistics();
    assert!(stats.log_cycles >= 3, "only {} cycles", stats.log_cycles);
    assert_eq!(stats.gauges.buffer_pages, 3);
    // Truncation keeps handing pages back, so the ring never runs dry.
    assert!(writer.space_left() > space_at_start - 2 * PAGE_SIZE as i64);
    writer.close()?;

    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 1);
    assert_eq!(scan.records[0].payload.as_ref(), numbered(rounds - 1, 1000).as_slice());
    assert_eq!(scan.orphan_parts, 0);
    Ok(())
}

#[test]
fn multi_part_records_survive_the_wrap() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("ring.log"))?);
    let writer = LogWriter::create(io.clone(), ring_options(9), Arc::new(NoopAuthority))?;

    for round in 0..12u32 {
        // With a three page buffer a part carries at most one page of data.
        let len = if round % 2 == 0 { 1000 } else { 6000 };
        let payload = numbered(round, len);
        writer.append_and_mark_bytes(payload.clone(), true)?;
        writer.truncate()?;

        let scan = LogScanner::open(io.clone())?.scan()?;
        assert_eq!(scan.records.len(), 1, "round {round}");
        assert_eq!(scan.records[0].payload.as_ref(), payload.as_slice());
        assert_eq!(scan.records[0].address, writer.header().start_byte_address);
        if len > PAGE_SIZE {
            assert_ne!(scan.records[0].multi_part_id, 0);
        }
    }
    assert!(writer.capture_statistics().log_cycles >= 1);
    writer.close()?;
    Ok(())
}
