//! The end-to-end copy pipeline.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use tracing::{debug, info};

use crate::dispatch::{run_pool, PoolPlan};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::platform::Platform;
use crate::report::CopyReport;
use crate::source::SourcePath;
use crate::volume::ClusterReader;

/// Copies files by reading their clusters from the raw volume.
///
/// The steps run strictly in order, and each failure ends the copy before the
/// next step starts:
///
/// 1. validate the source path (no I/O)
/// 2. resolve the file's extents (the source handle is closed afterwards)
/// 3. resolve the volume geometry
/// 4. open the volume device, then the output file
/// 5. copy with the worker pool
///
/// Handles opened in steps 2 and 4 are owned values, so they are closed on
/// every return path.
#[derive(Debug, Clone)]
pub struct RawCopier<P> {
    platform: P,
    options: Options,
}

#[cfg(any(target_os = "linux", windows))]
impl RawCopier<crate::platform::NativePlatform> {
    /// A copier for the current operating system.
    pub fn new(options: Options) -> Self {
        Self::with_platform(crate::platform::NativePlatform::new(), options)
    }
}

impl<P: Platform> RawCopier<P> {
    pub fn with_platform(platform: P, options: Options) -> Self {
        Self { platform, options }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Copy `source` into `output`, creating or truncating it.
    ///
    /// A partially written output is left in place on failure.
    pub fn copy(&self, source: &Path, output: &Path) -> Result<CopyReport> {
        let source = SourcePath::parse(source, P::SYNTAX)?;

        let extents = self.platform.query_extents(&source)?;
        info!(
            source = %source.path().display(),
            extents = extents.len(),
            "resolved cluster extents"
        );

        let geometry = self.platform.query_geometry(&source)?;
        info!(
            bytes_per_sector = geometry.bytes_per_sector(),
            sectors_per_cluster = geometry.sectors_per_cluster(),
            cluster_size = geometry.cluster_size(),
            "resolved volume geometry"
        );

        let volume = self.platform.open_volume(&source)?;
        debug!(volume = %volume.path().display(), "opened volume");

        let out = File::create(output).map_err(|e| Error::OutputOpenFailure {
            path: output.to_path_buf(),
            source: e,
        })?;

        let workers = self.options.worker_count().min(extents.len()).max(1);
        let plan = PoolPlan {
            workers,
            order: self.options.output_order,
            window: self.options.window_for(workers),
            budget: self.options.budget(),
        };
        debug!(
            workers,
            order = ?plan.order,
            window = plan.window,
            budget = plan.budget,
            "starting worker pool"
        );

        let reader = ClusterReader::new(volume.device(), geometry);
        let bytes_written = run_pool(&extents, &reader, BufWriter::new(out), plan)?;

        info!(
            output = %output.display(),
            bytes = bytes_written,
            "copy complete"
        );

        Ok(CopyReport {
            volume_path: volume.path().to_path_buf(),
            extents,
            geometry,
            workers,
            output_order: plan.order,
            bytes_written,
        })
    }
}
