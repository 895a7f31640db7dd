//! Positioned reads against the raw volume device.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::geometry::ClusterGeometry;

/// A device that supports positioned reads from shared references.
///
/// Workers share one handle, so reads must not depend on a file pointer.
pub trait VolumeRead {
    /// Read into `buf` starting at byte `offset`, returning the byte count.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

#[cfg(unix)]
impl VolumeRead for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl VolumeRead for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

/// An open volume device together with the path it was opened from.
///
/// The device is closed when this value is dropped.
#[derive(Debug)]
pub struct VolumeHandle<V> {
    path: PathBuf,
    device: V,
}

impl<V> VolumeHandle<V> {
    pub fn new(path: PathBuf, device: V) -> Self {
        Self { path, device }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device(&self) -> &V {
        &self.device
    }
}

/// Reads whole clusters from a volume.
pub struct ClusterReader<'a, V: ?Sized> {
    volume: &'a V,
    geometry: ClusterGeometry,
}

impl<'a, V: VolumeRead + ?Sized> ClusterReader<'a, V> {
    pub fn new(volume: &'a V, geometry: ClusterGeometry) -> Self {
        Self { volume, geometry }
    }

    pub fn geometry(&self) -> ClusterGeometry {
        self.geometry
    }

    /// Read `count` clusters starting at `lcn` into the front of `buf`.
    ///
    /// Returns the number of bytes read. Fewer bytes than requested means the
    /// device ended; the caller gets exactly what was read, unpadded.
    pub fn read_clusters(&self, lcn: u64, count: u64, buf: &mut [u8]) -> Result<usize> {
        let cluster_size = self.geometry.cluster_size();
        let offset = lcn
            .checked_mul(cluster_size)
            .filter(|offset| *offset <= i64::MAX as u64)
            .ok_or_else(|| Error::SeekFailure {
                lcn,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cluster offset is outside the addressable range",
                ),
            })?;

        let requested = count
            .checked_mul(cluster_size)
            .and_then(|len| usize::try_from(len).ok())
            .filter(|len| *len <= buf.len())
            .ok_or_else(|| Error::ReadFailure {
                lcn,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("buffer of {} bytes cannot hold {count} clusters", buf.len()),
                ),
            })?;

        let buf = &mut buf[..requested];
        let mut filled = 0usize;
        while filled < requested {
            let remaining = requested - filled;
            match self.volume.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) if n > remaining => {
                    return Err(Error::BufferOverflowDetected {
                        lcn,
                        requested,
                        returned: filled + n,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ReadFailure { lcn, source: e }),
            }
        }

        Ok(filled)
    }
}
