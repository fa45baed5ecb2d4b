//! Operator tool for ringwal log files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ringwal::primitives::io::{FileIo, StdFileIo};
use ringwal::primitives::wal::{
    FileLogHeader, LogOptions, LogScanner, LogWriter, NoopAuthority, PAGE_SIZE,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ringwal-inspect",
    version,
    about = "Format and inspect circular write-ahead log files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty log file
    Format {
        path: PathBuf,
        #[arg(long, help = "TOML file with log options")]
        config: Option<PathBuf>,
        #[arg(long, env = "RINGWAL_FILE_SIZE", help = "File size in bytes")]
        size: Option<u64>,
    },
    /// Show the file header
    Header { path: PathBuf },
    /// Walk the log and list its records
    Scan {
        path: PathBuf,
        #[arg(long, default_value_t = 16, help = "Payload bytes shown per record")]
        preview: usize,
    },
    /// Append synthetic records and report writer statistics
    Fill {
        path: PathBuf,
        #[arg(long, help = "TOML file with log options")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1000)]
        records: u64,
        #[arg(long, default_value_t = 200)]
        record_size: usize,
        #[arg(long, default_value_t = 100, help = "Force a flush every N records")]
        flush_every: u64,
    },
}

#[derive(Serialize)]
struct HeaderReport {
    file_size: u64,
    data_pages: u64,
    start_byte_address: u64,
    start_page: u64,
    sector_byte: u8,
    generation: u64,
}

impl From<&FileLogHeader> for HeaderReport {
    fn from(header: &FileLogHeader) -> Self {
        Self {
            file_size: header.file_size,
            data_pages: header.data_pages(),
            start_byte_address: header.start_byte_address,
            start_page: header.start_byte_address / PAGE_SIZE as u64,
            sector_byte: header.sector_byte,
            generation: header.generation(),
        }
    }
}

#[derive(Serialize)]
struct RecordReport {
    address: u64,
    multi_part_id: u8,
    len: usize,
    preview: String,
}

#[derive(Serialize)]
struct ScanReport {
    header: HeaderReport,
    pages_read: u64,
    next_page: u64,
    cycled: bool,
    padding_parts: u64,
    orphan_parts: u64,
    records: Vec<RecordReport>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Format { path, config, size } => {
            let mut options = load_options(config.as_deref())?;
            if let Some(size) = size {
                options.file_size = size;
            }
            let writer = LogWriter::create_path(&path, options)?;
            let report = HeaderReport::from(&writer.header());
            writer.close()?;
            emit(cli.format, &report, || {
                println!("Formatted {}", path.display());
                print_header_text(&report);
            })?;
        }
        Command::Header { path } => {
            let io = open_io(&path)?;
            let header = FileLogHeader::read(io.as_ref())?;
            let report = HeaderReport::from(&header);
            emit(cli.format, &report, || print_header_text(&report))?;
        }
        Command::Scan { path, preview } => {
            let scanner = LogScanner::open(open_io(&path)?)?;
            let scan = scanner.scan()?;
            let report = ScanReport {
                header: HeaderReport::from(scanner.header()),
                pages_read: scan.pages_read,
                next_page: scan.next_page,
                cycled: scan.cycled,
                padding_parts: scan.padding_parts,
                orphan_parts: scan.orphan_parts,
                records: scan
                    .records
                    .iter()
                    .map(|record| RecordReport {
                        address: record.address,
                        multi_part_id: record.multi_part_id,
                        len: record.payload.len(),
                        preview: hex::encode(&record.payload[..record.payload.len().min(preview)]),
                    })
                    .collect(),
            };
            emit(cli.format, &report, || print_scan_text(&report))?;
        }
        Command::Fill {
            path,
            config,
            records,
            record_size,
            flush_every,
        } => {
            let options = load_options(config.as_deref())?;
            let writer = LogWriter::create_path(&path, options)?;
            let mut payload = vec![0u8; record_size];
            for n in 0..records {
                payload
                    .iter_mut()
                    .enumerate()
                    .for_each(|(i, byte)| *byte = (n as usize + i) as u8);
                let force = flush_every != 0 && (n + 1) % flush_every == 0;
                writer.append_bytes(payload.clone(), force)?;
            }
            writer.flush()?;
            let stats = writer.capture_statistics();
            writer.close()?;
            emit(cli.format, &stats, || {
                println!("Appended {records} records of {record_size} bytes");
                for (key, value) in stats.to_map() {
                    print_field(&key, value);
                }
            })?;
        }
    }
    Ok(())
}

fn load_options(config: Option<&Path>) -> Result<LogOptions, Box<dyn Error>> {
    Ok(match config {
        Some(path) => LogOptions::load(path)?,
        None => LogOptions::default(),
    })
}

fn open_io(path: &Path) -> Result<Arc<dyn FileIo>, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("{} does not exist", path.display()).into());
    }
    Ok(Arc::new(StdFileIo::open(path)?))
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(40usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn print_header_text(report: &HeaderReport) {
    print_section("Header");
    print_field("File Size", report.file_size);
    print_field("Data Pages", report.data_pages);
    print_field("Start Address", report.start_byte_address);
    print_field("Start Page", report.start_page);
    print_field("Sector Marker", report.sector_byte);
    print_field("Generation", report.generation);
}

fn print_scan_text(report: &ScanReport) {
    print_header_text(&report.header);
    print_section("Scan");
    print_field("Pages Read", report.pages_read);
    print_field("Next Page", report.next_page);
    print_field("Wrapped", report.cycled);
    print_field("Padding Parts", report.padding_parts);
    print_field("Orphan Parts", report.orphan_parts);
    print_field("Records", report.records.len());
    print_section("Records");
    for record in &report.records {
        println!(
            "  @{:<10} id={:<3} len={:<6} {}",
            record.address, record.multi_part_id, record.len, record.preview
        );
    }
}
