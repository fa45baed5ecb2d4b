#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{
    LogOptions, LogScanner, LogWriter, NoopAuthority, FIRST_SEQUENCE, PAGE_SIZE,
};
use ringwal::types::Result;
use tempfile::tempdir;

fn open(path: &std::path::Path, options: LogOptions) -> Result<(Arc<LogWriter>, Arc<dyn FileIo>)> {
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
    let writer = LogWriter::create(io.clone(), options, Arc::new(NoopAuthority))?;
    Ok((Arc::new(writer), io))
}

/// Tags a payload with its producer and index so the scan can identify it.
fn tagged(producer: u8, index: u32, len: usize) -> Vec<u8> {
    let mut payload = vec![producer; len.max(5)];
    payload[1..5].copy_from_slice(&index.to_be_bytes());
    payload
}

#[test]
fn two_producers_share_a_three_page_buffer() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let options = LogOptions {
        file_size: 65 * PAGE_SIZE as u64,
        initial_buffer_pages: 3,
        max_buffer_pages: 3,
        padding_minimum_pages: 1,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    };
    let (writer, io) = open(&dir.path().join("pair.log"), options)?;
    let record_len = PAGE_SIZE + PAGE_SIZE / 2;
    let rounds = 10u32;
    let start = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2u8)
        .map(|producer| {
            let writer = Arc::clone(&writer);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<Vec<u64>> {
                start.wait();
                (0..rounds)
                    .map(|index| writer.append_bytes(tagged(producer, index, record_len), true))
                    .collect()
            })
        })
        .collect();
    let sequences: Vec<Vec<u64>> = handles
        .into_iter()
        .map(|handle| handle.join().expect("producer panicked"))
        .collect::<Result<_>>()?;

    for per_producer in &sequences {
        assert!(per_producer[0] >= FIRST_SEQUENCE);
        // A forced append returns after its last page was written, so the
        // next one from the same producer ends on a later page.
        assert!(per_producer.windows(2).all(|pair| pair[0] < pair[1]));
    }
    let snapshot = writer.buffer_snapshot();
    assert_eq!(snapshot.writers_active(), 0);
    assert_eq!(snapshot.pages.len(), 3);
    writer.close()?;

    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 2 * rounds as usize);
    assert_eq!(scan.orphan_parts, 0);
    for producer in 0..2u8 {
        let indexes: Vec<u32> = scan
            .records
            .iter()
            .filter(|record| record.payload[0] == producer)
            .map(|record| {
                assert_eq!(record.payload.len(), record_len);
                u32::from_be_bytes([
                    record.payload[1],
                    record.payload[2],
                    record.payload[3],
                    record.payload[4],
                ])
            })
            .collect();
        assert_eq!(indexes, (0..rounds).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn many_producers_leave_no_residual_writers() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let options = LogOptions {
        file_size: 8 * 1024 * 1024,
        initial_buffer_pages: 8,
        max_buffer_pages: 64,
        padding_minimum_pages: 2,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    };
    let (writer, io) = open(&dir.path().join("many.log"), options)?;
    let producers = 8u8;
    let per_producer = 150u32;
    let start = Arc::new(Barrier::new(producers as usize));

    let handles: Vec<_> = (0..producers)
        .map(|producer| {
            let writer = Arc::clone(&writer);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<()> {
                let mut rng = rand::rngs::StdRng::seed_from_u64(producer as u64);
                start.wait();
                for index in 0..per_producer {
                    let len = rng.gen_range(5..6_000);
                    let force = rng.gen_bool(0.1);
                    writer.append_bytes(tagged(producer, index, len), force)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer panicked")?;
    }
    writer.flush()?;
    assert_eq!(writer.buffer_snapshot().writers_active(), 0);

    let stats = writer.capture_statistics();
    assert!(stats.bytes_written > 0);
    assert!(stats.flush_requests > 0);
    writer.close()?;

    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.orphan_parts, 0);
    let seen: HashSet<(u8, u32)> = scan
        .records
        .iter()
        .map(|record| {
            let index = u32::from_be_bytes([
                record.payload[1],
                record.payload[2],
                record.payload[3],
                record.payload[4],
            ]);
            assert!(record.payload[5..].iter().all(|&b| b == record.payload[0]));
            (record.payload[0], index)
        })
        .collect();
    assert_eq!(seen.len(), producers as usize * per_producer as usize);
    Ok(())
}

#[test]
fn buffer_grows_under_pressure() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let options = LogOptions {
        file_size: 4 * 1024 * 1024,
        initial_buffer_pages: 4,
        max_buffer_pages: 32,
        padding_minimum_pages: 2,
        // Syncing every batch keeps the producer ahead of the helpers.
        sync_on_flush: true,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    };
    let (writer, io) = open(&dir.path().join("grow.log"), options)?;
    for index in 0..200u32 {
        writer.append_bytes(tagged(1, index, 3_000), false)?;
    }
    writer.flush()?;
    let stats = writer.capture_statistics();
    assert!(stats.threads_finding_full_buffers > 0);
    assert!(stats.gauges.buffer_pages > 4);
    assert!(stats.gauges.buffer_pages <= 32);
    writer.close()?;

    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 200);
    Ok(())
}
