//! Volume sector and cluster sizing.

use crate::error::{invalid_data, Error, Result};

/// Largest cluster size accepted before any volume access, in bytes.
pub const MAX_CLUSTER_SIZE: u64 = 1 << 30;

/// Sector and cluster sizing of the volume hosting the source file.
///
/// Construction validates the cluster size, so a value of this type always
/// describes a non-empty cluster no larger than [`MAX_CLUSTER_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterGeometry {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    cluster_size: u64,
}

impl ClusterGeometry {
    /// Build geometry from the values reported by the volume.
    pub fn new(bytes_per_sector: u32, sectors_per_cluster: u32) -> Result<Self> {
        let cluster_size = u64::from(bytes_per_sector) * u64::from(sectors_per_cluster);
        if cluster_size == 0 {
            return Err(Error::GeometryQueryFailure(invalid_data(format!(
                "volume reported {bytes_per_sector} bytes per sector and \
                 {sectors_per_cluster} sectors per cluster"
            ))));
        }
        if cluster_size > MAX_CLUSTER_SIZE {
            return Err(Error::ClusterSizeTooLarge(cluster_size));
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            cluster_size,
        })
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Cluster size as a buffer length.
    pub(crate) fn cluster_len(&self) -> usize {
        // Bounded by MAX_CLUSTER_SIZE, which fits every supported usize.
        self.cluster_size as usize
    }
}
