//! Linux backend: FIEMAP extents read straight from the block device.
//!
//! Extents come from the `FIEMAP` ioctl via [`blkmap`], the block device is
//! resolved with [`blkpath`], and the filesystem's fragment size (from
//! `statvfs`) plays the role of the cluster.
//!
//! `FIEMAP` needs an open descriptor (an `O_PATH` one is refused), so unlike
//! the Windows backend the source must be readable by the caller. The binary
//! escalates through `sudo` for that reason.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use blkmap::{ExtentFlags, Fiemap, FiemapExtent};
use blkpath::ResolveDevice;
use tracing::debug;

use super::Platform;
use crate::error::{invalid_data, Error, Result};
use crate::extent::{extents_from_runs, Extent, RetrievalRun, SPARSE_LCN};
use crate::geometry::ClusterGeometry;
use crate::source::{PathSyntax, SourcePath};
use crate::volume::VolumeHandle;

/// Sector unit the Linux block layer addresses devices in.
const SECTOR_SIZE: u64 = 512;

/// Backend for Linux filesystems that implement `FIEMAP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for LinuxPlatform {
    type Volume = File;

    const SYNTAX: PathSyntax = PathSyntax::Absolute;

    fn query_extents(&self, source: &SourcePath) -> Result<Vec<Extent>> {
        let path = source.path();
        let file = File::open(path).map_err(|e| Error::SourceOpenFailure {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| Error::SourceOpenFailure {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        if file_len == 0 {
            return Ok(Vec::new());
        }

        let block_size = fragment_size(path).map_err(Error::ExtentQueryFailure)?;
        let mapped = file
            .fiemap_range(0, file_len)
            .map_err(Error::ExtentQueryFailure)?;
        debug!(path = %path.display(), mapped = mapped.len(), "queried FIEMAP");

        let runs = runs_from_fiemap(&mapped, block_size, file_len)?;
        extents_from_runs(0, &runs)
    }

    fn query_geometry(&self, source: &SourcePath) -> Result<ClusterGeometry> {
        let block_size = fragment_size(source.path()).map_err(Error::GeometryQueryFailure)?;
        if block_size < SECTOR_SIZE || block_size % SECTOR_SIZE != 0 {
            return Err(Error::GeometryQueryFailure(invalid_data(format!(
                "fragment size {block_size} is not a multiple of {SECTOR_SIZE}"
            ))));
        }
        let sectors = u32::try_from(block_size / SECTOR_SIZE)
            .map_err(|_| Error::ClusterSizeTooLarge(block_size))?;
        ClusterGeometry::new(SECTOR_SIZE as u32, sectors)
    }

    fn open_volume(&self, source: &SourcePath) -> Result<VolumeHandle<File>> {
        let path = source.path();
        let device_path = path.resolve_device().map_err(|e| Error::VolumeOpenFailure {
            path: path.to_path_buf(),
            source: e,
        })?;
        let device = OpenOptions::new()
            .read(true)
            .open(&device_path)
            .map_err(|e| Error::VolumeOpenFailure {
                path: device_path.clone(),
                source: e,
            })?;
        Ok(VolumeHandle::new(device_path, device))
    }
}

/// Filesystem fragment size of the filesystem holding `path`.
fn fragment_size(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_frsize as u64)
}

/// Convert FIEMAP byte extents into cluster runs.
///
/// Gaps in the logical range, including a tail shorter than the file, become
/// [`SPARSE_LCN`] runs. Extents without a stable physical location are
/// rejected outright.
fn runs_from_fiemap(
    extents: &[FiemapExtent],
    block_size: u64,
    file_len: u64,
) -> Result<Vec<RetrievalRun>> {
    let end_vcn = file_len.div_ceil(block_size);
    let mut runs = Vec::with_capacity(extents.len());
    let mut vcn = 0u64;

    for extent in extents {
        if vcn >= end_vcn {
            break;
        }
        if extent.flags.is_unknown() || extent.flags.is_delalloc() {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} has no fixed location on disk",
                extent.logical
            )));
        }
        if extent.flags.is_encrypted() {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} is encrypted",
                extent.logical
            )));
        }
        if extent.flags.is_encoded() {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} is compressed or encoded",
                extent.logical
            )));
        }
        if extent.flags.is_inline()
            || extent
                .flags
                .intersects(ExtentFlags::DATA_TAIL | ExtentFlags::NOT_ALIGNED)
        {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} is stored inline or tail-packed",
                extent.logical
            )));
        }
        if extent.flags.is_unwritten() {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} is preallocated but unwritten",
                extent.logical
            )));
        }
        if extent.logical % block_size != 0 || extent.physical % block_size != 0 {
            return Err(Error::UnsupportedFileKind(format!(
                "extent at byte {} is not block aligned (inline or packed data)",
                extent.logical
            )));
        }

        let start = extent.logical / block_size;
        if start < vcn {
            return Err(Error::ExtentQueryFailure(invalid_data(format!(
                "extent at byte {} overlaps the previous extent",
                extent.logical
            ))));
        }
        if start > vcn {
            runs.push(RetrievalRun {
                next_vcn: start,
                lcn: SPARSE_LCN,
            });
        }

        let next_vcn = (start + extent.length.div_ceil(block_size)).min(end_vcn);
        if next_vcn > start {
            runs.push(RetrievalRun {
                next_vcn,
                lcn: extent.physical / block_size,
            });
        }
        vcn = next_vcn.max(vcn);
    }

    if vcn < end_vcn {
        runs.push(RetrievalRun {
            next_vcn: end_vcn,
            lcn: SPARSE_LCN,
        });
    }

    Ok(runs)
}
