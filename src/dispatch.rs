//! The worker pool that reads extents from the volume.
//!
//! Extents are handed out one at a time from a shared [`WorkQueue`], so a
//! worker that drew a large extent does not hold up the others. Each worker
//! reads its extent one cluster at a time in ascending LCN order and sends the
//! bytes to the calling thread, which owns the [`OutputSink`].
//!
//! In extent order the queue also meters memory: a worker on any extent but
//! the oldest unwritten one reserves each chunk against a byte budget before
//! sending it, and the writer hands the bytes back once they reach the output.

use std::io::Write;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::options::OutputOrder;
use crate::outcome::RunStatus;
use crate::sink::{Delivery, OutputSink};
use crate::volume::{ClusterReader, VolumeRead};

/// Chunks that may be queued between the workers and the sink, per worker.
const CHUNKS_PER_WORKER: usize = 4;

#[derive(Debug)]
struct Cursor {
    next: usize,
    limit: usize,
    closed: bool,
    /// Oldest extent not yet fully written.
    head: usize,
    /// Bytes admitted for later extents and not yet written.
    reserved: u64,
}

/// How a worker may send its next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Send as is; the writer takes it straight through.
    Direct,
    /// The bytes were counted against the budget.
    Reserved,
    /// The queue closed while waiting for budget; drop the extent.
    Stop,
}

/// Hands out extent indices in ascending order, each exactly once.
///
/// Indices at or past `limit` are held back until the limit is raised; a
/// closed queue hands out nothing more.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    len: usize,
    close_on_failure: bool,
    budget: Option<u64>,
    cursor: Mutex<Cursor>,
    released: Condvar,
}

impl WorkQueue {
    pub(crate) fn new(len: usize, limit: usize, close_on_failure: bool) -> Self {
        Self {
            len,
            close_on_failure,
            budget: None,
            cursor: Mutex::new(Cursor {
                next: 0,
                limit: limit.min(len),
                closed: false,
                head: 0,
                reserved: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Meter chunks of later extents against `bytes`.
    pub(crate) fn with_budget(mut self, bytes: u64) -> Self {
        self.budget = Some(bytes);
        self
    }

    /// Claim the next extent, waiting while it is held back.
    pub(crate) fn claim(&self) -> Option<usize> {
        let mut cursor = self.lock();
        loop {
            if cursor.closed || cursor.next >= self.len {
                return None;
            }
            if cursor.next < cursor.limit {
                let index = cursor.next;
                cursor.next += 1;
                return Some(index);
            }
            cursor = self
                .released
                .wait(cursor)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Allow indices below `limit` to be claimed. The limit never moves back.
    pub(crate) fn release_until(&self, limit: usize) {
        let mut cursor = self.lock();
        let limit = limit.min(self.len);
        if limit > cursor.limit {
            cursor.limit = limit;
            self.released.notify_all();
        }
    }

    /// Ask to send `len` bytes of `extent`, waiting while the budget is spent.
    ///
    /// The head extent is never held up. A chunk is always admitted when
    /// nothing is reserved, so the total stays within `max(budget, len)`.
    pub(crate) fn admit(&self, extent: usize, len: usize) -> Admission {
        let Some(budget) = self.budget else {
            return Admission::Direct;
        };
        let len = len as u64;
        let mut cursor = self.lock();
        loop {
            if extent <= cursor.head {
                return Admission::Direct;
            }
            if cursor.reserved == 0 || cursor.reserved.saturating_add(len) <= budget {
                cursor.reserved += len;
                return Admission::Reserved;
            }
            if cursor.closed {
                return Admission::Stop;
            }
            cursor = self
                .released
                .wait(cursor)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record that the first `head` extents are written and `returned`
    /// reserved bytes have left memory.
    pub(crate) fn settle(&self, head: usize, returned: u64) {
        let mut cursor = self.lock();
        if head <= cursor.head && returned == 0 {
            return;
        }
        cursor.head = cursor.head.max(head);
        cursor.reserved = cursor.reserved.saturating_sub(returned);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn reserved(&self) -> u64 {
        self.lock().reserved
    }

    /// Stop handing out work. Extents already claimed are unaffected.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.released.notify_all();
    }

    /// A worker gave up on its extent.
    pub(crate) fn abandon(&self) {
        if self.close_on_failure {
            self.close();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shape of one pool run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolPlan {
    pub workers: usize,
    pub order: OutputOrder,
    pub window: usize,
    pub budget: u64,
}

/// Copy every extent to `out` with a pool of workers.
///
/// Returns the number of bytes written. All workers are joined before this
/// returns, whether or not the copy succeeded.
pub(crate) fn run_pool<V, W>(
    extents: &[Extent],
    reader: &ClusterReader<'_, V>,
    out: W,
    plan: PoolPlan,
) -> Result<u64>
where
    V: VolumeRead + Sync + ?Sized,
    W: Write,
{
    let (window, close_on_failure) = match plan.order {
        OutputOrder::Extent => (plan.window.max(1), true),
        OutputOrder::Arrival => (extents.len(), false),
    };
    let queue = match plan.order {
        OutputOrder::Extent => {
            WorkQueue::new(extents.len(), window, close_on_failure).with_budget(plan.budget)
        }
        OutputOrder::Arrival => WorkQueue::new(extents.len(), window, close_on_failure),
    };
    let status = RunStatus::new();
    let mut sink = OutputSink::new(out, plan.order);
    let mut sink_failed = false;

    let capacity = plan.workers.saturating_mul(CHUNKS_PER_WORKER).max(1);
    let (tx, rx) = crossbeam_channel::bounded::<Delivery>(capacity);

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(plan.workers);
        for id in 0..plan.workers {
            let tx = tx.clone();
            let (queue, status) = (&queue, &status);
            let spawned = thread::Builder::new()
                .name(format!("rawcopy-worker-{id}"))
                .spawn_scoped(scope, move || work(id, extents, reader, queue, status, tx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = id, error = %e, "cannot spawn worker");
                    status.fail(Error::WorkerSpawnFailure(e));
                    queue.close();
                    break;
                }
            }
        }

        // Only worker-held senders remain, so the loop ends once they exit.
        drop(tx);

        for delivery in rx.iter() {
            if sink_failed {
                continue;
            }
            if let Err(e) = sink.accept(delivery) {
                error!(error = %e, "output write failed");
                status.fail(Error::WriteFailure(e));
                queue.close();
                sink_failed = true;
                continue;
            }
            let flushed = sink.flushed_extents();
            queue.settle(flushed, sink.take_released());
            queue.release_until(flushed.saturating_add(window));
        }

        for handle in handles {
            if handle.join().is_err() {
                debug!("worker exited by panic");
            }
        }
    });

    let held = sink.buffered_bytes();
    let written = if sink_failed {
        0
    } else {
        match sink.finish() {
            Ok(written) => written,
            Err(e) => {
                status.fail(Error::WriteFailure(e));
                0
            }
        }
    };

    if status.has_failed() {
        warn!(written, held, "copy failed, partial output left in place");
    }
    status.into_result()?;
    Ok(written)
}

/// Records a panic as a run failure and stops further claims, so the sink
/// never waits on an extent that will not arrive.
struct PanicGuard<'a> {
    queue: &'a WorkQueue,
    status: &'a RunStatus,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.status.fail(Error::WorkerPanicked);
            self.queue.close();
        }
    }
}

fn work<V>(
    id: usize,
    extents: &[Extent],
    reader: &ClusterReader<'_, V>,
    queue: &WorkQueue,
    status: &RunStatus,
    tx: Sender<Delivery>,
) where
    V: VolumeRead + ?Sized,
{
    let _guard = PanicGuard { queue, status };

    while let Some(index) = queue.claim() {
        let extent = extents[index];
        debug!(
            worker = id,
            extent = index,
            lcn = extent.lcn,
            clusters = extent.cluster_count,
            "claimed extent"
        );

        match copy_extent(index, extent, reader, queue, &tx) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                error!(worker = id, extent = index, error = %err, "worker stopped");
                status.fail(err);
                queue.abandon();
                return;
            }
        }
    }
}

/// Read one extent and forward it. Returns `Ok(false)` if the sink is gone or
/// the queue closed while the extent waited for budget.
fn copy_extent<V>(
    index: usize,
    extent: Extent,
    reader: &ClusterReader<'_, V>,
    queue: &WorkQueue,
    tx: &Sender<Delivery>,
) -> Result<bool>
where
    V: VolumeRead + ?Sized,
{
    let cluster_len = reader.geometry().cluster_len();

    for i in 0..extent.cluster_count {
        let lcn = extent.lcn + i;
        let mut data = vec![0u8; cluster_len];
        let n = reader.read_clusters(lcn, 1, &mut data)?;
        if n < cluster_len {
            warn!(lcn, read = n, expected = cluster_len, "short read from volume");
        }
        data.truncate(n);

        let reserved = match queue.admit(index, data.len()) {
            Admission::Direct => false,
            Admission::Reserved => true,
            Admission::Stop => {
                debug!(extent = index, lcn, "queue closed, dropping extent");
                return Ok(false);
            }
        };
        let chunk = Delivery::Chunk {
            extent: index,
            data,
            reserved,
        };
        if tx.send(chunk).is_err() {
            return Ok(false);
        }
    }

    Ok(tx.send(Delivery::Finished { extent: index }).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ClusterGeometry;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const CLUSTER: usize = 16;

    /// In-memory volume where cluster `n` is filled with byte `n % 251`.
    struct Image {
        clusters: usize,
        fail_at: Option<u64>,
        reads: AtomicUsize,
    }

    impl Image {
        fn new(clusters: usize) -> Self {
            Self {
                clusters,
                fail_at: None,
                reads: AtomicUsize::new(0),
            }
        }

        fn failing_at(clusters: usize, lcn: u64) -> Self {
            Self {
                fail_at: Some(lcn),
                ..Self::new(clusters)
            }
        }

        fn bytes(lcn: u64) -> Vec<u8> {
            vec![(lcn % 251) as u8; CLUSTER]
        }
    }

    impl VolumeRead for Image {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let lcn = offset / CLUSTER as u64;
            if Some(lcn) == self.fail_at {
                return Err(io::Error::from_raw_os_error(1117));
            }
            let end = (self.clusters * CLUSTER) as u64;
            if offset >= end {
                return Ok(0);
            }
            let n = buf.len().min((end - offset) as usize);
            for (i, b) in buf[..n].iter_mut().enumerate() {
                *b = (((offset + i as u64) / CLUSTER as u64) % 251) as u8;
            }
            Ok(n)
        }
    }

    fn geometry() -> ClusterGeometry {
        ClusterGeometry::new(CLUSTER as u32, 1).unwrap()
    }

    fn expected(extents: &[Extent]) -> Vec<u8> {
        extents
            .iter()
            .flat_map(|e| (e.lcn..e.lcn + e.cluster_count).flat_map(Image::bytes))
            .collect()
    }

    fn extents() -> Vec<Extent> {
        vec![
            Extent { cluster_count: 9, lcn: 40 },
            Extent { cluster_count: 1, lcn: 3 },
            Extent { cluster_count: 30, lcn: 100 },
            Extent { cluster_count: 2, lcn: 7 },
            Extent { cluster_count: 5, lcn: 60 },
        ]
    }

    fn plan(workers: usize, order: OutputOrder) -> PoolPlan {
        PoolPlan {
            workers,
            order,
            window: 2,
            budget: 1 << 20,
        }
    }

    #[test]
    fn test_queue_hands_out_each_index_once() {
        let queue = WorkQueue::new(100, 100, false);
        let claimed = Mutex::new(Vec::new());
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    while let Some(i) = queue.claim() {
                        claimed.lock().unwrap().push(i);
                    }
                });
            }
        });
        let mut claimed = claimed.into_inner().unwrap();
        claimed.sort_unstable();
        assert_eq!(claimed, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_holds_back_until_released() {
        let queue = WorkQueue::new(3, 1, true);
        assert_eq!(queue.claim(), Some(0));

        let waiter = Arc::new(queue);
        let q = Arc::clone(&waiter);
        let handle = thread::spawn(move || q.claim());
        thread::sleep(Duration::from_millis(20));
        waiter.release_until(2);
        assert_eq!(handle.join().unwrap(), Some(1));

        waiter.release_until(1);
        waiter.close();
        assert_eq!(waiter.claim(), None);
    }

    #[test]
    fn test_abandon_closes_only_when_configured() {
        let queue = WorkQueue::new(4, 4, false);
        queue.abandon();
        assert_eq!(queue.claim(), Some(0));

        let queue = WorkQueue::new(4, 4, true);
        queue.abandon();
        assert_eq!(queue.claim(), None);
    }

    #[test]
    fn test_admit_without_budget_is_direct() {
        let queue = WorkQueue::new(4, 4, false);
        assert_eq!(queue.admit(3, 1 << 30), Admission::Direct);
        assert_eq!(queue.reserved(), 0);
    }

    #[test]
    fn test_admit_meters_later_extents_only() {
        let queue = WorkQueue::new(4, 4, true).with_budget(32);
        assert_eq!(queue.admit(0, 16), Admission::Direct);
        assert_eq!(queue.admit(1, 16), Admission::Reserved);
        assert_eq!(queue.admit(2, 16), Admission::Reserved);
        assert_eq!(queue.reserved(), 32);
        // The head keeps going with the budget spent.
        assert_eq!(queue.admit(0, 16), Admission::Direct);

        queue.settle(1, 16);
        assert_eq!(queue.reserved(), 16);
        assert_eq!(queue.admit(1, 16), Admission::Direct);
    }

    #[test]
    fn test_oversized_chunk_admitted_when_nothing_reserved() {
        let queue = WorkQueue::new(4, 4, true).with_budget(8);
        assert_eq!(queue.admit(1, 64), Admission::Reserved);
        assert_eq!(queue.reserved(), 64);
    }

    #[test]
    fn test_admit_waits_until_bytes_return() {
        let queue = Arc::new(WorkQueue::new(4, 4, true).with_budget(16));
        assert_eq!(queue.admit(2, 16), Admission::Reserved);

        let q = Arc::clone(&queue);
        let handle = thread::spawn(move || q.admit(3, 16));
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        queue.settle(0, 16);
        assert_eq!(handle.join().unwrap(), Admission::Reserved);
        assert_eq!(queue.reserved(), 16);
    }

    #[test]
    fn test_admit_stops_once_closed() {
        let queue = Arc::new(WorkQueue::new(4, 4, true).with_budget(16));
        assert_eq!(queue.admit(1, 16), Admission::Reserved);

        let q = Arc::clone(&queue);
        let handle = thread::spawn(move || q.admit(2, 16));
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(handle.join().unwrap(), Admission::Stop);

        // The head is still let through on a closed queue.
        assert_eq!(queue.admit(0, 16), Admission::Direct);
    }

    /// Volume whose read of `gate` stalls until `ahead_wanted` clusters at or
    /// past `ahead_from` have been read, or a timeout passes.
    struct Gated {
        gate: u64,
        ahead_from: u64,
        ahead_wanted: usize,
        ahead: AtomicUsize,
        seen_at_gate: AtomicUsize,
    }

    impl Gated {
        fn new(gate: u64, ahead_from: u64, ahead_wanted: usize) -> Self {
            Self {
                gate,
                ahead_from,
                ahead_wanted,
                ahead: AtomicUsize::new(0),
                seen_at_gate: AtomicUsize::new(0),
            }
        }
    }

    impl VolumeRead for Gated {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let lcn = offset / CLUSTER as u64;
            if lcn >= self.ahead_from {
                self.ahead.fetch_add(1, Ordering::SeqCst);
            }
            if lcn == self.gate {
                let deadline = Instant::now() + Duration::from_millis(300);
                while self.ahead.load(Ordering::SeqCst) < self.ahead_wanted
                    && Instant::now() < deadline
                {
                    thread::sleep(Duration::from_millis(1));
                }
                self.seen_at_gate
                    .store(self.ahead.load(Ordering::SeqCst), Ordering::SeqCst);
            }
            buf.fill((lcn % 251) as u8);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_reorder_budget_bounds_read_ahead() {
        // Extent 0 stalls on its second cluster while extent 1 is large.
        let image = Gated::new(1, 100, 1000);
        let reader = ClusterReader::new(&image, geometry());
        let extents = [
            Extent { cluster_count: 2, lcn: 0 },
            Extent { cluster_count: 1000, lcn: 100 },
        ];
        let budget_clusters = 8;
        let plan = PoolPlan {
            workers: 2,
            order: OutputOrder::Extent,
            window: 4,
            budget: (budget_clusters * CLUSTER) as u64,
        };

        let mut out = Vec::new();
        let written = run_pool(&extents, &reader, &mut out, plan).unwrap();

        // One more cluster may have been read and be waiting for admission.
        let ahead = image.seen_at_gate.load(Ordering::SeqCst);
        assert!(ahead <= budget_clusters + 1, "read {ahead} clusters ahead");
        assert_eq!(written, 1002 * CLUSTER as u64);
        assert_eq!(out, expected(&extents));
    }

    #[test]
    fn test_write_failure_with_buffered_extents_drains_workers() {
        struct Counting {
            writes: usize,
        }
        impl Write for Counting {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                self.writes += 1;
                Err(io::Error::from_raw_os_error(28))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        // Extent 0 is held until later extents are buffered in the sink.
        let image = Gated::new(0, 100, 6);
        let reader = ClusterReader::new(&image, geometry());
        let extents = [
            Extent { cluster_count: 1, lcn: 0 },
            Extent { cluster_count: 20, lcn: 100 },
            Extent { cluster_count: 20, lcn: 200 },
        ];
        let plan = PoolPlan {
            workers: 3,
            order: OutputOrder::Extent,
            window: 3,
            budget: (4 * CLUSTER) as u64,
        };

        let mut out = Counting { writes: 0 };
        let err = run_pool(&extents, &reader, &mut out, plan).unwrap_err();

        assert!(matches!(err, Error::WriteFailure(_)));
        assert_eq!(out.writes, 1);
        assert!(image.seen_at_gate.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_single_worker_reads_consecutive_clusters() {
        let image = Image::new(64);
        let geometry = geometry();
        let reader = ClusterReader::new(&image, geometry);
        let extent = [Extent { cluster_count: 6, lcn: 10 }];

        let mut out = Vec::new();
        let written = run_pool(&extent, &reader, &mut out, plan(1, OutputOrder::Arrival)).unwrap();

        assert_eq!(written, 6 * CLUSTER as u64);
        assert_eq!(out, expected(&extent));
    }

    #[test]
    fn test_extent_order_is_deterministic_with_many_workers() {
        let image = Image::new(256);
        let reader = ClusterReader::new(&image, geometry());
        let extents = extents();

        for _ in 0..10 {
            let mut out = Vec::new();
            run_pool(&extents, &reader, &mut out, plan(4, OutputOrder::Extent)).unwrap();
            assert_eq!(out, expected(&extents));
        }
    }

    #[test]
    fn test_arrival_order_keeps_length_and_extent_contents() {
        let image = Image::new(256);
        let reader = ClusterReader::new(&image, geometry());
        let extents = extents();
        let total: u64 = extents.iter().map(|e| e.cluster_count).sum();

        let mut out = Vec::new();
        let written = run_pool(&extents, &reader, &mut out, plan(4, OutputOrder::Arrival)).unwrap();
        assert_eq!(written, total * CLUSTER as u64);
        assert_eq!(out.len() as u64, written);

        // Each cluster is present exactly as often as the source holds it.
        let mut got: Vec<u8> = out.chunks(CLUSTER).map(|c| c[0]).collect();
        let mut want: Vec<u8> = expected(&extents).chunks(CLUSTER).map(|c| c[0]).collect();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want);
    }

    #[test]
    fn test_read_failure_fails_run() {
        let image = Image::failing_at(256, 102);
        let reader = ClusterReader::new(&image, geometry());
        let extents = extents();

        for order in [OutputOrder::Extent, OutputOrder::Arrival] {
            let mut out = Vec::new();
            let err = run_pool(&extents, &reader, &mut out, plan(3, order)).unwrap_err();
            assert!(matches!(err, Error::ReadFailure { lcn: 102, .. }));
            assert_eq!(err.os_code(), Some(1117));
        }
    }

    #[test]
    fn test_extent_order_output_stops_at_failed_extent() {
        let image = Image::failing_at(256, 102);
        let reader = ClusterReader::new(&image, geometry());
        let extents = extents();

        let mut out = Vec::new();
        run_pool(&extents, &reader, &mut out, plan(2, OutputOrder::Extent)).unwrap_err();

        // Extents 0 and 1 precede the failing one and are intact; extent 2
        // contributes at most its first two clusters.
        let prefix = expected(&extents[..2]);
        assert!(out.starts_with(&prefix));
        assert!(out.len() <= prefix.len() + 2 * CLUSTER);
    }

    #[test]
    fn test_arrival_failure_does_not_stop_siblings() {
        let image = Image::failing_at(256, 40);
        let reader = ClusterReader::new(&image, geometry());
        let extents = extents();

        let mut out = Vec::new();
        run_pool(&extents, &reader, &mut out, plan(2, OutputOrder::Arrival)).unwrap_err();

        // Everything except the failed extent 0 still gets copied.
        let rest: u64 = extents[1..].iter().map(|e| e.cluster_count).sum();
        assert_eq!(out.len() as u64, rest * CLUSTER as u64);
    }

    #[test]
    fn test_write_failure_fails_run() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::from_raw_os_error(28))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let image = Image::new(256);
        let reader = ClusterReader::new(&image, geometry());
        let err = run_pool(&extents(), &reader, Full, plan(4, OutputOrder::Extent)).unwrap_err();
        assert!(matches!(err, Error::WriteFailure(_)));
        assert_eq!(err.os_code(), Some(28));
    }

    #[test]
    fn test_no_extents_writes_nothing() {
        let image = Image::new(4);
        let reader = ClusterReader::new(&image, geometry());
        let mut out = Vec::new();
        let written = run_pool(&[], &reader, &mut out, plan(1, OutputOrder::Extent)).unwrap();
        assert_eq!(written, 0);
        assert!(out.is_empty());
        assert_eq!(image.reads.load(Ordering::Relaxed), 0);
    }
}
