//! Operating system backends.
//!
//! A [`Platform`] supplies the three facilities a raw copy needs from the OS:
//! listing a file's on-disk extents without reading its data, reporting the
//! volume's cluster geometry, and opening the raw volume device.

use crate::error::Result;
use crate::extent::Extent;
use crate::geometry::ClusterGeometry;
use crate::source::{PathSyntax, SourcePath};
use crate::volume::{VolumeHandle, VolumeRead};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

/// The backend for the current operating system.
#[cfg(target_os = "linux")]
pub type NativePlatform = LinuxPlatform;
/// The backend for the current operating system.
#[cfg(windows)]
pub type NativePlatform = WindowsPlatform;

/// OS facilities used by a raw copy.
///
/// Every handle a method opens is either closed before it returns or owned by
/// the value it returns.
pub trait Platform {
    /// Raw volume device type.
    type Volume: VolumeRead + Sync;

    /// Source path spelling this backend understands.
    const SYNTAX: PathSyntax;

    /// List the clusters backing `source`, in logical order.
    ///
    /// Should not require permission to read the file's data. The Linux
    /// backend is the exception: `FIEMAP` only works on a readable descriptor.
    fn query_extents(&self, source: &SourcePath) -> Result<Vec<Extent>>;

    /// Sector and cluster sizing of the volume hosting `source`.
    fn query_geometry(&self, source: &SourcePath) -> Result<ClusterGeometry>;

    /// Open the raw device of the volume hosting `source` for reading.
    fn open_volume(&self, source: &SourcePath) -> Result<VolumeHandle<Self::Volume>>;
}
