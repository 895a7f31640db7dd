//! Error type shared by every stage of a raw copy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a raw copy can fail.
///
/// Failures are terminal: nothing in the crate retries. Variants that wrap an
/// OS failure keep the original [`io::Error`] as their source so the OS error
/// code survives up to the caller (see [`Error::os_code`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid source path {path:?}: expected {expected}")]
    InvalidPathFormat { path: PathBuf, expected: &'static str },

    #[error("cannot open source file {}: {source}", .path.display())]
    SourceOpenFailure { path: PathBuf, source: io::Error },

    #[error("extent query failed: {0}")]
    ExtentQueryFailure(#[source] io::Error),

    #[error("extent list truncated after {resolved} extent(s)")]
    ExtentListTruncated { resolved: usize },

    #[error("unsupported file layout: {0}")]
    UnsupportedFileKind(String),

    #[error("volume geometry query failed: {0}")]
    GeometryQueryFailure(#[source] io::Error),

    #[error("cluster size of {0} bytes exceeds the 1 GiB limit")]
    ClusterSizeTooLarge(u64),

    #[error("cannot open volume {}: {source}", .path.display())]
    VolumeOpenFailure { path: PathBuf, source: io::Error },

    #[error("cannot open output file {}: {source}", .path.display())]
    OutputOpenFailure { path: PathBuf, source: io::Error },

    #[error("seek to cluster {lcn} failed: {source}")]
    SeekFailure { lcn: u64, source: io::Error },

    #[error("read of cluster {lcn} failed: {source}")]
    ReadFailure { lcn: u64, source: io::Error },

    #[error("read of cluster {lcn} returned {returned} bytes into a {requested} byte buffer")]
    BufferOverflowDetected {
        lcn: u64,
        requested: usize,
        returned: usize,
    },

    #[error("write to output failed: {0}")]
    WriteFailure(#[source] io::Error),

    #[error("cannot spawn worker thread: {0}")]
    WorkerSpawnFailure(#[source] io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("cannot escalate privileges: {0}")]
    PrivilegeEscalationFailure(String),
}

impl Error {
    /// The underlying OS error code, if this failure came from the OS.
    pub fn os_code(&self) -> Option<i32> {
        self.io_source().and_then(io::Error::raw_os_error)
    }

    /// Process exit code for this failure.
    ///
    /// Every failure maps to 1; success is 0.
    pub fn exit_code(&self) -> i32 {
        1
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Error::SourceOpenFailure { source, .. }
            | Error::VolumeOpenFailure { source, .. }
            | Error::OutputOpenFailure { source, .. }
            | Error::SeekFailure { source, .. }
            | Error::ReadFailure { source, .. } => Some(source),
            Error::ExtentQueryFailure(source)
            | Error::GeometryQueryFailure(source)
            | Error::WriteFailure(source)
            | Error::WorkerSpawnFailure(source) => Some(source),
            _ => None,
        }
    }
}

/// Build an [`io::ErrorKind::InvalidData`] error for malformed OS replies.
pub(crate) fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
