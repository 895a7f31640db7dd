//! Summary returned from a successful copy.

use std::path::PathBuf;

use crate::extent::Extent;
use crate::geometry::ClusterGeometry;
use crate::options::OutputOrder;

/// Result state from a copy operation.
#[derive(Debug, Clone)]
pub struct CopyReport {
    /// Path of the raw volume device the clusters were read from.
    pub volume_path: PathBuf,

    /// Extents of the source file, in logical order.
    pub extents: Vec<Extent>,

    /// Geometry of the source volume.
    pub geometry: ClusterGeometry,

    /// Number of worker threads used.
    pub workers: usize,

    /// Ordering applied to the output.
    pub output_order: OutputOrder,

    /// Number of bytes written to the output.
    pub bytes_written: u64,
}

impl CopyReport {
    /// Total clusters across all extents.
    pub fn total_clusters(&self) -> u64 {
        self.extents.iter().map(|e| e.cluster_count).sum()
    }

    /// Bytes a complete copy produces: every cluster, cluster-size aligned.
    pub fn expected_bytes(&self) -> u64 {
        self.total_clusters()
            .saturating_mul(self.geometry.cluster_size())
    }

    /// Whether fewer bytes were written than the extents cover, which happens
    /// when the volume ended early.
    pub fn is_short(&self) -> bool {
        self.bytes_written < self.expected_bytes()
    }
}
