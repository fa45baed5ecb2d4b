#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{
    CheckpointAuthority, LogOptions, LogRecord, LogScanner, LogWriter, NoopAuthority,
    HEADER_REGION_LEN, PAGE_SIZE,
};
use ringwal::types::Result;
use tempfile::tempdir;

fn options() -> LogOptions {
    LogOptions {
        file_size: 65 * PAGE_SIZE as u64,
        initial_buffer_pages: 8,
        max_buffer_pages: 8,
        padding_minimum_pages: 1,
        sync_on_flush: false,
        flush_idle_wait_ms: 5,
        ..LogOptions::default()
    }
}

fn create(path: &std::path::Path, options: LogOptions) -> Result<(LogWriter, Arc<dyn FileIo>)> {
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
    let writer = LogWriter::create(io.clone(), options, Arc::new(NoopAuthority))?;
    Ok((writer, io))
}

struct Gate {
    reached: Sender<()>,
    release: Receiver<()>,
}

/// Record whose source stalls between its first and second part.
struct StallingRecord {
    data: Vec<u8>,
    position: usize,
    gate: Mutex<Option<Gate>>,
}

impl LogRecord for StallingRecord {
    fn bytes_remaining(&self) -> usize {
        if self.position > 0 && self.position < self.data.len() {
            if let Some(gate) = self.gate.lock().take() {
                let _ = gate.reached.send(());
                let _ = gate.release.recv();
            }
        }
        self.data.len() - self.position
    }

    fn is_first_part(&self) -> bool {
        self.position == 0
    }

    fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len() - self.position);
        dst[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }
}

#[derive(Default)]
struct CountingAuthority {
    suggested: AtomicU64,
    high: AtomicU64,
}

impl CheckpointAuthority for CountingAuthority {
    fn suggest_checkpoint(&self, _occupancy: f32) {
        self.suggested.fetch_add(1, Ordering::SeqCst);
    }

    fn occupancy_high(&self, _occupancy: f32) {
        self.high.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn truncate_moves_start_to_the_mark() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(&dir.path().join("mark.log"), options())?;
    writer.append_bytes(vec![1u8; 100], false)?;
    writer.append_and_mark_bytes(vec![2u8; 200], false)?;
    writer.append_bytes(vec![3u8; 300], true)?;

    let mark = writer.mark_point();
    assert_eq!(mark.address, HEADER_REGION_LEN + 1 + 104);
    assert_eq!(writer.header().start_byte_address, HEADER_REGION_LEN);
    writer.truncate()?;
    let header = writer.header();
    assert_eq!(header.start_byte_address, mark.address);
    assert_eq!(header.sector_byte, mark.sector_byte);
    writer.close()?;

    let scanner = LogScanner::open(io)?;
    assert_eq!(scanner.header().start_byte_address, mark.address);
    let scan = scanner.scan()?;
    let lens: Vec<usize> = scan.records.iter().map(|r| r.payload.len()).collect();
    assert_eq!(lens, vec![200, 300]);
    assert_eq!(scan.records[0].address, mark.address);
    Ok(())
}

#[test]
fn in_flight_multi_part_record_holds_the_mark_back() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(&dir.path().join("stall.log"), options())?;
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let large: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
    let mut record = StallingRecord {
        data: large.clone(),
        position: 0,
        gate: Mutex::new(Some(Gate {
            reached: reached_tx,
            release: release_rx,
        })),
    };

    thread::scope(|scope| -> Result<()> {
        let writer = &writer;
        let producer = scope.spawn(move || writer.append(&mut record, 0, true, false));
        reached_rx.recv().expect("first part copied");

        writer.append_and_mark_bytes(&b"marked while the large record is open"[..], false)?;
        assert_eq!(writer.mark_point().address, HEADER_REGION_LEN + 1);

        release_tx.send(()).expect("producer waiting");
        producer.join().expect("producer panicked")?;
        Ok(())
    })?;

    writer.truncate()?;
    assert_eq!(writer.header().start_byte_address, HEADER_REGION_LEN + 1);
    let scan = LogScanner::open(io.clone())?.scan()?;
    assert_eq!(scan.records.len(), 2);
    assert!(scan.records.iter().any(|r| r.payload.as_ref() == large.as_slice()));

    // With nothing in flight the next mark stands where it is set.
    writer.append_and_mark_bytes(&b"later"[..], true)?;
    let mark = writer.mark_point();
    assert!(mark.address > HEADER_REGION_LEN + large.len() as u64);
    writer.truncate()?;
    writer.close()?;
    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 1);
    assert_eq!(scan.records[0].payload.as_ref(), b"later");
    Ok(())
}

#[test]
fn truncate_races_with_marking_appends() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, io) = create(
        &dir.path().join("race.log"),
        LogOptions {
            file_size: 1025 * PAGE_SIZE as u64,
            ..options()
        },
    )?;

    thread::scope(|scope| -> Result<()> {
        let writer = &writer;
        let marker = scope.spawn(move || -> Result<()> {
            for n in 0..400u32 {
                writer.append_and_mark_bytes(n.to_be_bytes().repeat(125), false)?;
            }
            Ok(())
        });
        for _ in 0..40 {
            writer.truncate()?;
            // The new start always lies in data that already reached the file.
            let start = writer.header().start_byte_address;
            assert!(start <= writer.buffer_snapshot().file_position);
        }
        marker.join().expect("marker panicked")?;
        Ok(())
    })?;

    writer.truncate()?;
    let start = writer.header().start_byte_address;
    assert!(start < writer.buffer_snapshot().file_position);
    writer.close()?;
    let scan = LogScanner::open(io)?.scan()?;
    assert_eq!(scan.records.len(), 1);
    assert_eq!(scan.records[0].address, start);
    assert_eq!(scan.records[0].payload.as_ref(), 399u32.to_be_bytes().repeat(125));
    Ok(())
}

#[test]
fn truncate_returns_space() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (writer, _io) = create(&dir.path().join("space.log"), options())?;
    let initial = writer.space_left();
    writer.append_bytes(vec![4u8; 3000], false)?;
    writer.append_bytes(vec![5u8; 3000], false)?;
    writer.append_and_mark_bytes(vec![6u8; 3000], true)?;
    let before = writer.space_left();
    assert!(before < initial);
    writer.truncate()?;
    assert!(writer.space_left() > before);

    // A second truncate with the same mark reclaims nothing more.
    let after = writer.space_left();
    writer.truncate()?;
    assert_eq!(writer.space_left(), after);
    writer.close()?;
    Ok(())
}

#[test]
fn occupancy_drives_checkpoint_suggestions() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("busy.log"))?);
    let authority = Arc::new(CountingAuthority::default());
    let writer = LogWriter::create(
        io,
        LogOptions {
            checkpoint_threshold: 0.5,
            occupancy_high_threshold: 0.6,
            ..options()
        },
        authority.clone(),
    )?;

    writer.append_bytes(vec![7u8; 1000], true)?;
    assert_eq!(authority.suggested.load(Ordering::SeqCst), 0);
    assert!(!writer.is_occupancy_high());

    for _ in 0..10 {
        writer.append_bytes(vec![8u8; 15_000], true)?;
    }
    assert!(writer.is_occupancy_high());
    assert!(authority.suggested.load(Ordering::SeqCst) > 0);
    // Only the transition is reported.
    assert_eq!(authority.high.load(Ordering::SeqCst), 1);
    assert!(writer.capture_statistics().checkpoints_triggered > 0);
    writer.close()?;
    Ok(())
}
