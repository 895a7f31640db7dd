//! CLI tool for copying locked files through the raw volume.
//!
//! This tool uses the `rawcopy` library to resolve the source file's extents
//! and read its clusters directly from the underlying volume device.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use rawcopy::{Error, Options, OutputOrder};

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "RAWCOPY_LOG";

/// Copy a file that cannot be opened for reading, straight from the volume.
///
/// The source file's cluster extents are looked up without reading the file,
/// then each cluster is read from the raw volume device and written to the
/// output file.
#[derive(Parser, Debug)]
#[command(name = "rawcopy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the file to copy (e.g. C:\Windows\System32\config\SAM)
    source: PathBuf,

    /// Path of the copy to create or overwrite
    output: PathBuf,

    /// Number of worker threads (default: hardware concurrency)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Order of extents in the output
    #[arg(long, value_enum, default_value_t = OrderArg::Extent)]
    order: OrderArg,

    /// Extents that may be read ahead of the oldest unwritten one (0: auto)
    #[arg(long, default_value = "0")]
    reorder_window: usize,

    /// Bytes of read-ahead extent data held in memory (0: 64 MiB)
    #[arg(long, default_value = "0")]
    reorder_budget: u64,

    /// Enable verbose output (debug logging and the extent table)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OrderArg {
    /// File order, reproducible for any worker count
    Extent,
    /// Whatever order clusters are read in
    Arrival,
}

impl From<OrderArg> for OutputOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Extent => OutputOrder::Extent,
            OrderArg::Arrival => OutputOrder::Arrival,
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let err = Error::InvalidArguments(e.to_string());
            let _ = e.print();
            process::exit(err.exit_code());
        }
    };

    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    // A second initialisation can only fail in tests; nothing to report.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(any(target_os = "linux", windows))]
fn run(args: &Args) -> rawcopy::Result<()> {
    use rawcopy::RawCopy;

    // Reading the raw device needs root; elevation is the caller's job, not
    // the library's.
    #[cfg(target_os = "linux")]
    sudo::escalate_if_needed().map_err(|e| Error::PrivilegeEscalationFailure(e.to_string()))?;

    let mut options = Options::new()
        .with_output_order(args.order.into())
        .with_reorder_window(args.reorder_window)
        .with_reorder_budget(args.reorder_budget);
    if let Some(workers) = args.workers {
        options = options.with_workers(workers);
    }

    let report = args.source.raw_copy_to_opt(&args.output, &options)?;

    if args.verbose {
        print_extent_table(&report);
    }
    if report.is_short() {
        eprintln!(
            "Warning: volume ended early, {} of {} bytes copied",
            report.bytes_written,
            report.expected_bytes()
        );
    }
    eprintln!("File successfully copied to {}", args.output.display());

    Ok(())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn run(_args: &Args) -> rawcopy::Result<()> {
    Err(Error::InvalidArguments(
        "raw volume access is not supported on this platform".to_string(),
    ))
}

#[cfg(any(target_os = "linux", windows))]
fn print_extent_table(report: &rawcopy::CopyReport) {
    let geometry = report.geometry;
    eprintln!();
    eprintln!("Volume: {}", report.volume_path.display());
    eprintln!(
        "Geometry: {} bytes/sector, {} sectors/cluster ({} bytes/cluster)",
        geometry.bytes_per_sector(),
        geometry.sectors_per_cluster(),
        geometry.cluster_size()
    );
    eprintln!("Workers: {} ({:?} order)", report.workers, report.output_order);
    eprintln!();
    eprintln!("{:<6} {:<20} {:<20} {:<20}", "Index", "LCN", "Clusters", "Bytes");
    eprintln!("{}", "-".repeat(70));

    for (i, extent) in report.extents.iter().enumerate() {
        eprintln!(
            "{:<6} 0x{:016x} {:<20} {:<20}",
            i,
            extent.lcn,
            extent.cluster_count,
            extent.byte_len(geometry.cluster_size())
        );
    }
    eprintln!("{}", "-".repeat(70));
    eprintln!(
        "Total: {} extent(s), {} cluster(s), {} bytes written",
        report.extents.len(),
        report.total_clusters(),
        report.bytes_written
    );
}
