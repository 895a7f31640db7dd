//! Failure aggregation across workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};

/// Shared failure state for one copy run.
///
/// Any participant may record a failure; recording is idempotent and never
/// interrupts anyone else. The first error recorded is the one reported once
/// every worker has finished.
#[derive(Debug, Default)]
pub(crate) struct RunStatus {
    failed: AtomicBool,
    first: Mutex<Option<Error>>,
}

impl RunStatus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(&self, err: Error) {
        self.failed.store(true, Ordering::Release);
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(err);
        } else {
            debug!(error = %err, "additional failure after the first");
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Overall outcome; call after every worker has terminated.
    pub(crate) fn into_result(self) -> Result<()> {
        let first = self
            .first
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clean_run_succeeds() {
        let status = RunStatus::new();
        assert!(!status.has_failed());
        assert!(status.into_result().is_ok());
    }

    #[test]
    fn test_first_failure_wins() {
        let status = RunStatus::new();
        status.fail(Error::ClusterSizeTooLarge(1));
        status.fail(Error::WorkerPanicked);
        assert!(status.has_failed());
        assert!(matches!(
            status.into_result(),
            Err(Error::ClusterSizeTooLarge(1))
        ));
    }

    #[test]
    fn test_concurrent_failures() {
        let status = RunStatus::new();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| status.fail(Error::WorkerPanicked));
            }
        });
        assert!(status.has_failed());
        assert!(matches!(status.into_result(), Err(Error::WorkerPanicked)));
    }
}
