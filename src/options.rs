//! Configuration options for raw copy operations.

use std::num::NonZeroUsize;
use std::thread;

/// Worker count used when hardware concurrency cannot be detected.
pub const FALLBACK_WORKERS: usize = 4;

/// Bytes of out-of-turn extent data held in memory when no budget is set.
pub const DEFAULT_REORDER_BUDGET: u64 = 64 * 1024 * 1024;

/// Order in which copied clusters land in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputOrder {
    /// Output follows the file's logical order.
    ///
    /// Extents finished out of turn are held in memory until every earlier
    /// extent has been written, so the output is reproducible for any worker
    /// count. [`Options::reorder_budget`] caps how much is held.
    #[default]
    Extent,

    /// Each cluster is written as soon as it is read.
    ///
    /// Clusters of one extent stay in order, but with more than one worker
    /// different extents interleave unpredictably.
    Arrival,
}

/// Options for controlling the copy.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of worker threads.
    ///
    /// `None` uses the detected hardware concurrency, or
    /// [`FALLBACK_WORKERS`] when it cannot be detected.
    pub workers: Option<usize>,

    /// Output byte ordering across extents.
    pub output_order: OutputOrder,

    /// How many extents may be handed out ahead of the oldest unwritten one
    /// when writing in [`OutputOrder::Extent`].
    ///
    /// Zero picks twice the worker count.
    pub reorder_window: usize,

    /// Bytes of out-of-turn extent data the writer may hold at once when
    /// writing in [`OutputOrder::Extent`].
    ///
    /// Workers reading a later extent pause once the budget is used up; the
    /// worker reading the oldest unwritten extent never does. Zero picks
    /// [`DEFAULT_REORDER_BUDGET`]. A single cluster larger than the budget is
    /// still let through when nothing else is buffered.
    pub reorder_budget: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: None,
            output_order: OutputOrder::Extent,
            reorder_window: 0,
            reorder_budget: 0,
        }
    }
}

impl Options {
    /// Create a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed number of worker threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Choose the output byte ordering.
    pub fn with_output_order(mut self, order: OutputOrder) -> Self {
        self.output_order = order;
        self
    }

    /// Set the reorder window, in extents.
    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    /// Set the reorder budget, in bytes.
    pub fn with_reorder_budget(mut self, bytes: u64) -> Self {
        self.reorder_budget = bytes;
        self
    }

    /// Resolved worker count, never zero.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(FALLBACK_WORKERS),
        }
    }

    /// Resolved reorder window for `workers` threads, never zero.
    pub fn window_for(&self, workers: usize) -> usize {
        match self.reorder_window {
            0 => workers.saturating_mul(2).max(1),
            n => n,
        }
    }

    /// Resolved reorder budget in bytes, never zero.
    pub fn budget(&self) -> u64 {
        match self.reorder_budget {
            0 => DEFAULT_REORDER_BUDGET,
            n => n,
        }
    }
}
