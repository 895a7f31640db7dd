//! Windows backend: NTFS retrieval pointers read from `\\.\X:`.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::{MetadataExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::ptr;

use tracing::debug;
use windows_sys::Win32::Foundation::{ERROR_MORE_DATA, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    GetDiskFreeSpaceW, FILE_ATTRIBUTE_COMPRESSED, FILE_ATTRIBUTE_ENCRYPTED,
    FILE_ATTRIBUTE_SPARSE_FILE, FILE_FLAG_BACKUP_SEMANTICS, FILE_READ_ATTRIBUTES,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
};
use windows_sys::Win32::System::Ioctl::FSCTL_GET_RETRIEVAL_POINTERS;
use windows_sys::Win32::System::IO::DeviceIoControl;

use super::Platform;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentAccumulator, RetrievalBatch};
use crate::geometry::ClusterGeometry;
use crate::source::{PathSyntax, SourcePath};
use crate::volume::VolumeHandle;

/// Reply buffer for one retrieval-pointers query, in 8-byte words.
const QUERY_BUFFER_WORDS: usize = 512;

/// Backend for NTFS (and other volumes that answer
/// `FSCTL_GET_RETRIEVAL_POINTERS`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for WindowsPlatform {
    type Volume = File;

    const SYNTAX: PathSyntax = PathSyntax::Drive;

    fn query_extents(&self, source: &SourcePath) -> Result<Vec<Extent>> {
        let path = source.path();
        let open_failed = |e: io::Error| Error::SourceOpenFailure {
            path: path.to_path_buf(),
            source: e,
        };

        // Attribute access only: metadata and FSCTLs, which locked files
        // still allow.
        let file = OpenOptions::new()
            .access_mode(FILE_READ_ATTRIBUTES)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE)
            .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
            .open(path)
            .map_err(open_failed)?;

        let metadata = file.metadata().map_err(open_failed)?;
        if !has_mapped_data(metadata.file_attributes(), metadata.len())? {
            debug!(path = %path.display(), "empty file, nothing to map");
            return Ok(Vec::new());
        }

        // A non-empty file resident in its MFT record has no runs; the query
        // fails with ERROR_HANDLE_EOF and surfaces as ExtentQueryFailure.
        let extents = query_retrieval_pointers(&file)?;
        debug!(path = %path.display(), extents = extents.len(), "queried retrieval pointers");
        Ok(extents)
    }

    fn query_geometry(&self, source: &SourcePath) -> Result<ClusterGeometry> {
        let root = source.volume_root().ok_or_else(|| {
            Error::GeometryQueryFailure(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source path has no drive letter",
            ))
        })?;
        let root: Vec<u16> = std::ffi::OsStr::new(&root)
            .encode_wide()
            .chain(iter::once(0))
            .collect();

        let (mut sectors_per_cluster, mut bytes_per_sector) = (0u32, 0u32);
        let (mut free_clusters, mut total_clusters) = (0u32, 0u32);
        // SAFETY: root is NUL terminated and every out pointer is a live u32.
        let ok = unsafe {
            GetDiskFreeSpaceW(
                root.as_ptr(),
                &mut sectors_per_cluster,
                &mut bytes_per_sector,
                &mut free_clusters,
                &mut total_clusters,
            )
        };
        if ok == 0 {
            return Err(Error::GeometryQueryFailure(io::Error::last_os_error()));
        }

        ClusterGeometry::new(bytes_per_sector, sectors_per_cluster)
    }

    fn open_volume(&self, source: &SourcePath) -> Result<VolumeHandle<File>> {
        let device_path = source.volume_device().ok_or_else(|| Error::VolumeOpenFailure {
            path: source.path().to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "source path has no drive letter"),
        })?;
        let device = OpenOptions::new()
            .read(true)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(&device_path)
            .map_err(|e| Error::VolumeOpenFailure {
                path: device_path.clone(),
                source: e,
            })?;
        Ok(VolumeHandle::new(device_path, device))
    }
}

/// Reject layouts whose clusters do not hold the file's bytes as is.
///
/// Returns false for an empty file, which has no runs to query.
fn has_mapped_data(attributes: u32, len: u64) -> Result<bool> {
    for (flag, kind) in [
        (FILE_ATTRIBUTE_COMPRESSED, "compressed"),
        (FILE_ATTRIBUTE_ENCRYPTED, "encrypted"),
        (FILE_ATTRIBUTE_SPARSE_FILE, "sparse"),
    ] {
        if attributes & flag != 0 {
            return Err(Error::UnsupportedFileKind(format!("file is {kind}")));
        }
    }
    Ok(len > 0)
}

/// Issue `FSCTL_GET_RETRIEVAL_POINTERS` until the whole run list is read.
fn query_retrieval_pointers(file: &File) -> Result<Vec<Extent>> {
    let handle = file.as_raw_handle() as HANDLE;
    let mut words = vec![0u64; QUERY_BUFFER_WORDS];
    let out_len = mem::size_of_val(words.as_slice());
    let mut acc = ExtentAccumulator::new();

    loop {
        // STARTING_VCN_INPUT_BUFFER is a single LARGE_INTEGER.
        let starting_vcn = acc.next_vcn() as i64;
        let mut returned = 0u32;
        // SAFETY: both buffers outlive the call and their sizes are passed
        // alongside; the call is synchronous.
        let ok = unsafe {
            DeviceIoControl(
                handle,
                FSCTL_GET_RETRIEVAL_POINTERS,
                (&starting_vcn as *const i64).cast::<c_void>(),
                mem::size_of::<i64>() as u32,
                words.as_mut_ptr().cast::<c_void>(),
                out_len as u32,
                &mut returned,
                ptr::null_mut(),
            )
        };

        let more = if ok != 0 {
            false
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(ERROR_MORE_DATA as i32) {
                return Err(Error::ExtentQueryFailure(err));
            }
            true
        };

        // SAFETY: the u64 buffer is viewed as bytes without changing its
        // length in bytes.
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr().cast::<u8>(), out_len) };
        let batch = RetrievalBatch::parse(bytes)?;
        acc.push(&batch, more)?;

        if !more {
            return Ok(acc.finish());
        }
        debug!(resolved = acc.len(), next_vcn = acc.next_vcn(), "continuing extent query");
    }
}
