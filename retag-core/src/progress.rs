//! Cancellation and progress reporting.
//!
//! Every container carries a [`Progress`] handle. The abort flag may be set
//! from another thread through an [`AbortHandle`]; long-running operations
//! poll it before each top-level element, before each cluster and inside
//! copy loops.

use crate::error::{Error, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with a phase description and a completion ratio in
/// `0.0..=1.0`.
pub type StatusCallback = dyn Fn(&str, f64) + Send + Sync;

/// Shared abort flag plus an optional status callback.
#[derive(Clone, Default)]
pub struct Progress {
    abort: Arc<AtomicBool>,
    callback: Option<Arc<StatusCallback>>,
}

impl Progress {
    /// Creates a handle that reports through `callback`.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&str, f64) + Send + Sync + 'static,
    {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            callback: Some(Arc::new(callback)),
        }
    }

    /// Returns a handle that can cancel the operation from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            abort: Arc::clone(&self.abort),
        }
    }

    /// Returns whether the abort flag is set.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Raises `OperationAborted` when the abort flag is set.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::OperationAborted)
        } else {
            Ok(())
        }
    }

    /// Reports a new phase with an initial completion ratio.
    pub fn status(&self, phase: &str, ratio: f64) {
        if let Some(callback) = &self.callback {
            callback(phase, ratio.clamp(0.0, 1.0));
        }
    }

    /// Reports `done / total` as a completion ratio for the current phase.
    pub fn report_ratio(&self, done: u64, total: u64) {
        if let Some(callback) = &self.callback {
            let ratio = if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            };
            callback("", ratio.clamp(0.0, 1.0));
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("aborted", &self.is_aborted())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Externally ownable handle that cancels the associated operation.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    abort: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Sets the abort flag.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Clears the abort flag so the container can be used again.
    pub fn reset(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_abort_flag() {
        let progress = Progress::default();
        assert!(progress.check_aborted().is_ok());

        let handle = progress.abort_handle();
        handle.abort();
        assert!(matches!(
            progress.check_aborted(),
            Err(Error::OperationAborted)
        ));

        handle.reset();
        assert!(progress.check_aborted().is_ok());
    }

    #[test]
    fn test_callback_receives_ratio() {
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let progress = Progress::with_callback(move |_, ratio| {
            seen_clone.lock().unwrap().push(ratio);
        });
        progress.report_ratio(1, 4);
        progress.report_ratio(4, 4);
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 1.0]);
    }

    #[test]
    fn test_clone_shares_abort_flag() {
        let progress = Progress::default();
        let clone = progress.clone();
        progress.abort_handle().abort();
        assert!(clone.is_aborted());
    }
}
