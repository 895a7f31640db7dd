//! The single writer that owns the output stream.
//!
//! Workers never touch the output; they send [`Delivery`] messages and this
//! sink applies them one at a time, so writes are exclusive by construction.
//! The ordering decision lives here and nowhere else.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::options::OutputOrder;

/// A message from a worker to the sink.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Bytes read for the next cluster of `extent`. `reserved` is set when
    /// the bytes were counted against the reorder budget.
    Chunk {
        extent: usize,
        data: Vec<u8>,
        reserved: bool,
    },
    /// Every cluster of `extent` has been delivered.
    Finished { extent: usize },
}

#[derive(Debug, Default)]
struct Pending {
    chunks: Vec<Vec<u8>>,
    reserved: u64,
    finished: bool,
}

pub(crate) struct OutputSink<W: Write> {
    out: W,
    order: OutputOrder,
    /// Oldest extent not yet fully written (extent order only).
    head: usize,
    pending: BTreeMap<usize, Pending>,
    finished: usize,
    bytes_written: u64,
    /// Reserved bytes written since the last [`OutputSink::take_released`].
    released: u64,
}

impl<W: Write> OutputSink<W> {
    pub(crate) fn new(out: W, order: OutputOrder) -> Self {
        Self {
            out,
            order,
            head: 0,
            pending: BTreeMap::new(),
            finished: 0,
            bytes_written: 0,
            released: 0,
        }
    }

    /// Apply one delivery.
    pub(crate) fn accept(&mut self, delivery: Delivery) -> io::Result<()> {
        match (self.order, delivery) {
            (OutputOrder::Arrival, Delivery::Chunk { data, reserved, .. }) => {
                self.write(&data)?;
                self.settle(reserved, &data);
                Ok(())
            }
            (OutputOrder::Arrival, Delivery::Finished { .. }) => {
                self.finished += 1;
                Ok(())
            }
            (OutputOrder::Extent, Delivery::Chunk { extent, data, reserved }) => {
                if extent == self.head {
                    self.write(&data)?;
                    self.settle(reserved, &data);
                } else {
                    let pending = self.pending.entry(extent).or_default();
                    if reserved {
                        pending.reserved += data.len() as u64;
                    }
                    pending.chunks.push(data);
                }
                Ok(())
            }
            (OutputOrder::Extent, Delivery::Finished { extent }) => {
                self.finished += 1;
                if extent == self.head {
                    self.head += 1;
                    self.drain_ready()
                } else {
                    self.pending.entry(extent).or_default().finished = true;
                    Ok(())
                }
            }
        }
    }

    /// Number of leading extents whose bytes are all in the output.
    ///
    /// In arrival order this is the count of finished extents.
    pub(crate) fn flushed_extents(&self) -> usize {
        match self.order {
            OutputOrder::Extent => self.head,
            OutputOrder::Arrival => self.finished,
        }
    }

    /// Reserved bytes that reached the output since the previous call.
    pub(crate) fn take_released(&mut self) -> u64 {
        std::mem::take(&mut self.released)
    }

    /// Bytes held for extents that cannot be written yet.
    pub(crate) fn buffered_bytes(&self) -> u64 {
        self.pending
            .values()
            .flat_map(|p| &p.chunks)
            .map(|c| c.len() as u64)
            .sum()
    }

    /// Flush the stream and return the total bytes written.
    ///
    /// Extents still held back (because an earlier one never finished) are
    /// dropped.
    pub(crate) fn finish(mut self) -> io::Result<u64> {
        self.out.flush()?;
        Ok(self.bytes_written)
    }

    fn drain_ready(&mut self) -> io::Result<()> {
        while let Some(pending) = self.pending.remove(&self.head) {
            for chunk in &pending.chunks {
                self.write(chunk)?;
            }
            self.released += pending.reserved;
            if !pending.finished {
                // The new head is still being read; its remaining chunks
                // stream straight through.
                break;
            }
            self.head += 1;
        }
        Ok(())
    }

    fn settle(&mut self, reserved: bool, data: &[u8]) {
        if reserved {
            self.released += data.len() as u64;
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}
