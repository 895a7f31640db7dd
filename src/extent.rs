//! Cluster extents and the decoding of filesystem run lists.
//!
//! Filesystems describe a file's on-disk layout as a list of runs: each run
//! ends at a logical cluster boundary (the next VCN) and starts at a physical
//! cluster (the LCN). This module turns such run lists into [`Extent`]s, and
//! parses the raw reply buffer of the NTFS retrieval-pointers query, including
//! the continuation protocol used when a file has more runs than fit in one
//! reply.

use crate::error::{invalid_data, Error, Result};

/// Physical cluster index the filesystem reports for a run with no backing
/// storage (sparse hole or compressed tail).
pub const SPARSE_LCN: u64 = u64::MAX;

/// A contiguous run of clusters on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Number of clusters in the run. Never zero.
    pub cluster_count: u64,
    /// First logical cluster number on the volume.
    pub lcn: u64,
}

impl Extent {
    /// Byte length of the extent for the given cluster size.
    pub fn byte_len(&self, cluster_size: u64) -> u64 {
        self.cluster_count.saturating_mul(cluster_size)
    }
}

/// One run as reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalRun {
    /// Logical cluster index one past the end of this run.
    pub next_vcn: u64,
    /// Physical starting cluster, or [`SPARSE_LCN`].
    pub lcn: u64,
}

/// Decode a run list starting at `starting_vcn` into extents.
///
/// Each extent's cluster count is the distance between consecutive logical
/// boundaries, the first one measured from `starting_vcn`.
pub fn extents_from_runs(starting_vcn: u64, runs: &[RetrievalRun]) -> Result<Vec<Extent>> {
    let mut extents = Vec::with_capacity(runs.len());
    let mut boundary = starting_vcn;

    for run in runs {
        if run.lcn == SPARSE_LCN {
            return Err(Error::UnsupportedFileKind(format!(
                "run at VCN {boundary} has no backing clusters (sparse or compressed file)"
            )));
        }

        let cluster_count = match run.next_vcn.checked_sub(boundary) {
            Some(count) if count > 0 => count,
            _ => {
                return Err(Error::ExtentQueryFailure(invalid_data(format!(
                    "run boundary {} does not advance past VCN {boundary}",
                    run.next_vcn
                ))))
            }
        };

        if run.lcn.checked_add(cluster_count).is_none() {
            return Err(Error::ExtentQueryFailure(invalid_data(format!(
                "run at LCN {} with {cluster_count} clusters overflows the volume",
                run.lcn
            ))));
        }

        extents.push(Extent {
            cluster_count,
            lcn: run.lcn,
        });
        boundary = run.next_vcn;
    }

    Ok(extents)
}

/// Size of the fixed header of a retrieval-pointers reply.
pub const RETRIEVAL_HEADER_LEN: usize = 16;
/// Size of one (NextVcn, Lcn) entry in a retrieval-pointers reply.
pub const RETRIEVAL_ENTRY_LEN: usize = 16;

/// One reply of the retrieval-pointers query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalBatch {
    pub starting_vcn: u64,
    pub runs: Vec<RetrievalRun>,
}

impl RetrievalBatch {
    /// Parse a raw reply buffer.
    ///
    /// Layout (little endian): `u32` extent count, 4 bytes padding, `i64`
    /// starting VCN, then `count` pairs of `i64` next VCN and `i64` LCN.
    /// A declared count that does not fit in `buf` means the reply was cut
    /// short and is reported as [`Error::ExtentListTruncated`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RETRIEVAL_HEADER_LEN {
            return Err(Error::ExtentQueryFailure(invalid_data(format!(
                "retrieval reply of {} bytes is shorter than its header",
                buf.len()
            ))));
        }

        let count = u32::from_le_bytes(read_array(buf, 0)) as usize;
        let starting_vcn = u64::from_le_bytes(read_array(buf, 8));
        let capacity = (buf.len() - RETRIEVAL_HEADER_LEN) / RETRIEVAL_ENTRY_LEN;
        if count > capacity {
            return Err(Error::ExtentListTruncated { resolved: capacity });
        }

        let runs = (0..count)
            .map(|i| {
                let at = RETRIEVAL_HEADER_LEN + i * RETRIEVAL_ENTRY_LEN;
                RetrievalRun {
                    next_vcn: u64::from_le_bytes(read_array(buf, at)),
                    lcn: u64::from_le_bytes(read_array(buf, at + 8)),
                }
            })
            .collect();

        Ok(Self { starting_vcn, runs })
    }
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

/// Collects extents across successive retrieval replies.
///
/// A query is first issued at [`next_vcn`](Self::next_vcn) zero; while the
/// filesystem reports more data, the next query starts where the previous
/// reply ended.
#[derive(Debug, Default)]
pub struct ExtentAccumulator {
    extents: Vec<Extent>,
    next_vcn: Option<u64>,
}

impl ExtentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical cluster index the next query should start from.
    pub fn next_vcn(&self) -> u64 {
        self.next_vcn.unwrap_or(0)
    }

    /// Number of extents collected so far.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Add one reply. `more` is set when the filesystem signalled that the
    /// reply did not hold every remaining run.
    pub fn push(&mut self, batch: &RetrievalBatch, more: bool) -> Result<()> {
        if let Some(expected) = self.next_vcn {
            if batch.starting_vcn != expected {
                return Err(Error::ExtentQueryFailure(invalid_data(format!(
                    "continuation reply starts at VCN {} instead of {expected}",
                    batch.starting_vcn
                ))));
            }
        }

        if more && batch.runs.is_empty() {
            return Err(Error::ExtentListTruncated {
                resolved: self.extents.len(),
            });
        }

        let extents = extents_from_runs(batch.starting_vcn, &batch.runs)?;
        self.next_vcn = Some(
            batch
                .runs
                .last()
                .map_or(batch.starting_vcn, |run| run.next_vcn),
        );
        self.extents.extend(extents);
        Ok(())
    }

    pub fn finish(self) -> Vec<Extent> {
        self.extents
    }
}
