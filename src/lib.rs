//! # rawcopy
//!
//! Copy files the operating system refuses to open, by reading their clusters
//! straight from the underlying volume.
//!
//! ## Overview
//!
//! A file that is locked, in use, or denied for reading can usually still be
//! opened with no access rights at all. That is enough to ask the filesystem
//! where the file lives on disk. `rawcopy` takes that extent list and reads
//! the clusters directly from the raw volume device, bypassing the file-level
//! lock. This is useful for:
//!
//! - Registry hives, page files and databases held open by running services
//! - Forensic acquisition of individual files from a live system
//! - Backing up files whose owner refuses shared reads
//!
//! ## Features
//!
//! - Extent resolution through `FSCTL_GET_RETRIEVAL_POINTERS` (Windows) or
//!   `FIEMAP` via `blkmap` (Linux), with continuation for long run lists
//! - Block device resolution using `blkpath` on Linux
//! - A worker pool that balances whole extents dynamically across threads
//! - Deterministic output in file order, or arrival order on request
//! - Compressed, encrypted and sparse files are detected and rejected
//!
//! ## Example
//!
//! ```no_run
//! use rawcopy::{Options, OutputOrder, RawCopy};
//! use std::path::Path;
//!
//! let source = Path::new(r"C:\Windows\System32\config\SAM");
//!
//! // Simple copy
//! let report = source.raw_copy_to(Path::new("SAM.bin")).unwrap();
//! println!("Copied {} bytes from {}", report.bytes_written, report.volume_path.display());
//!
//! // Copy with options
//! let options = Options::new().with_workers(2).with_output_order(OutputOrder::Extent);
//! source.raw_copy_to_opt(Path::new("SAM.bin"), &options).unwrap();
//! ```
//!
//! ## Safety
//!
//! Reading a raw volume requires administrator (Windows) or root (Linux)
//! privileges. The library never elevates; the CLI tool requests elevation
//! where the platform supports it.

mod copier;
mod dispatch;
mod error;
mod extent;
mod geometry;
mod options;
mod outcome;
pub mod platform;
mod report;
mod sink;
mod source;
mod volume;

pub use copier::RawCopier;
pub use error::{Error, Result};
pub use extent::{
    extents_from_runs, Extent, ExtentAccumulator, RetrievalBatch, RetrievalRun, SPARSE_LCN,
};
pub use geometry::{ClusterGeometry, MAX_CLUSTER_SIZE};
pub use options::{Options, OutputOrder, DEFAULT_REORDER_BUDGET, FALLBACK_WORKERS};
pub use platform::Platform;
pub use report::CopyReport;
pub use source::{PathSyntax, SourcePath};
pub use volume::{ClusterReader, VolumeHandle, VolumeRead};

#[cfg(any(target_os = "linux", windows))]
use std::path::{Path, PathBuf};

/// Trait for copying files through the raw volume.
///
/// # Example
///
/// ```no_run
/// use rawcopy::{Options, RawCopy};
/// use std::path::Path;
///
/// let report = Path::new("/var/lib/app/state.db")
///     .raw_copy_to_opt(Path::new("/tmp/state.db"), &Options::new().with_workers(1))
///     .unwrap();
/// assert_eq!(report.workers, 1);
/// ```
#[cfg(any(target_os = "linux", windows))]
pub trait RawCopy {
    /// Copy this file to `output` with default options.
    fn raw_copy_to(&self, output: &Path) -> Result<CopyReport> {
        self.raw_copy_to_opt(output, &Options::default())
    }

    /// Copy this file to `output` with options.
    fn raw_copy_to_opt(&self, output: &Path, options: &Options) -> Result<CopyReport>;
}

#[cfg(any(target_os = "linux", windows))]
impl RawCopy for Path {
    fn raw_copy_to_opt(&self, output: &Path, options: &Options) -> Result<CopyReport> {
        RawCopier::new(options.clone()).copy(self, output)
    }
}

#[cfg(any(target_os = "linux", windows))]
impl RawCopy for PathBuf {
    fn raw_copy_to_opt(&self, output: &Path, options: &Options) -> Result<CopyReport> {
        self.as_path().raw_copy_to_opt(output, options)
    }
}
