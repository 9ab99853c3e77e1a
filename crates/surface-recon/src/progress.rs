//! Progress reporting and cooperative cancellation.
//!
//! Long stages report `(stage, fraction)` through a [`ProgressCallback`] and
//! poll a [`CancellationToken`] at bounded intervals: every chunk of points in
//! the parallel neighbor loops, every few solver iterations, and between
//! octree levels.
//!
//! # Example
//!
//! ```
//! use surface_recon::progress::{CancellationToken, ProgressCallback, ProgressTracker};
//! use surface_recon::Stage;
//!
//! let callback: ProgressCallback = Box::new(|p| {
//!     println!("{}: {}% {}", p.stage, p.percent(), p.message);
//!     true // return false to cancel
//! });
//!
//! let token = CancellationToken::new();
//! let tracker = ProgressTracker::new(Stage::Filtering, token, Some(&callback));
//! tracker.report_now(0.5, "halfway").unwrap();
//! ```

use crate::error::{ReconError, ReconResult};
use crate::pipeline::Stage;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Progress information passed to callbacks.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Stage currently running.
    pub stage: Stage,

    /// Fraction of the stage completed (0.0 to 1.0).
    pub fraction: f64,

    /// Human-readable message describing the current step.
    pub message: String,

    /// Time since the stage started.
    pub elapsed: Duration,
}

impl Progress {
    /// Create a new progress report.
    pub fn new(stage: Stage, fraction: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    /// Get progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction * 100.0).round() as u32
    }

    /// Check if the stage is complete.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.fraction >= 1.0
    }
}

/// Callback function for progress reporting.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// A cloneable cancellation flag shared between the caller and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the "running" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Visible to every clone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-stage progress and cancellation state.
///
/// Safe to share across rayon workers: the cancellation flag is atomic and
/// the throttle timestamp sits behind a mutex.
pub struct ProgressTracker<'a> {
    stage: Stage,
    token: CancellationToken,
    callback: Option<&'a ProgressCallback>,
    start_time: Instant,
    last_callback_time: Mutex<Instant>,
    callback_interval: Duration,
}

impl<'a> ProgressTracker<'a> {
    /// Create a tracker for one stage.
    pub fn new(
        stage: Stage,
        token: CancellationToken,
        callback: Option<&'a ProgressCallback>,
    ) -> Self {
        let now = Instant::now();
        Self {
            stage,
            token,
            callback,
            start_time: now,
            last_callback_time: Mutex::new(now),
            callback_interval: Duration::from_millis(100),
        }
    }

    /// A tracker with no callback and a private token, for standalone calls.
    pub fn silent(stage: Stage) -> Self {
        Self::new(stage, CancellationToken::new(), None)
    }

    /// Set the minimum time between throttled callbacks.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.callback_interval = interval;
        self
    }

    /// Stage this tracker reports for.
    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The shared cancellation token.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time since the tracker was created.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Return `Err(Cancelled)` if cancellation was requested.
    #[inline]
    pub fn checkpoint(&self) -> ReconResult<()> {
        if self.token.is_cancelled() {
            Err(ReconError::cancelled(self.stage))
        } else {
            Ok(())
        }
    }

    /// Report progress if the throttle interval has elapsed, then poll the
    /// token.
    pub fn report(&self, fraction: f64, message: impl Into<String>) -> ReconResult<()> {
        self.checkpoint()?;
        if self.callback.is_none() {
            return Ok(());
        }

        let now = Instant::now();
        let due = match self.last_callback_time.lock() {
            Ok(mut last) if now.duration_since(*last) >= self.callback_interval => {
                *last = now;
                true
            }
            _ => false,
        };

        if due {
            self.invoke(fraction, message.into())?;
        }
        Ok(())
    }

    /// Report progress unconditionally, then poll the token.
    pub fn report_now(&self, fraction: f64, message: impl Into<String>) -> ReconResult<()> {
        self.checkpoint()?;
        if self.callback.is_some() {
            if let Ok(mut last) = self.last_callback_time.lock() {
                *last = Instant::now();
            }
            self.invoke(fraction, message.into())?;
        }
        Ok(())
    }

    fn invoke(&self, fraction: f64, message: String) -> ReconResult<()> {
        let Some(callback) = self.callback else {
            return Ok(());
        };

        let mut progress = Progress::new(self.stage, fraction, message);
        progress.elapsed = self.elapsed();

        if !callback(&progress) {
            self.token.cancel();
        }
        self.checkpoint()
    }
}

impl std::fmt::Debug for ProgressTracker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("stage", &self.stage)
            .field("cancelled", &self.token.is_cancelled())
            .field("has_callback", &self.callback.is_some())
            .field("callback_interval", &self.callback_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_progress_percent() {
        let p = Progress::new(Stage::Filtering, 0.5, "test");
        assert_eq!(p.percent(), 50);
        assert!(!p.is_complete());
        assert!(Progress::new(Stage::Filtering, 1.5, "done").is_complete());
    }

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_checkpoint_reports_stage() {
        let tracker = ProgressTracker::silent(Stage::Downsampling);
        assert!(tracker.checkpoint().is_ok());
        tracker.token().cancel();
        match tracker.checkpoint() {
            Err(ReconError::Cancelled { stage }) => assert_eq!(stage, Stage::Downsampling),
            other => panic!("Expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_callback_false_cancels() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let callback: ProgressCallback = Box::new(move |p| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            p.fraction < 0.5
        });

        let tracker = ProgressTracker::new(Stage::Reconstructing, CancellationToken::new(), Some(&callback))
            .with_interval(Duration::ZERO);

        assert!(tracker.report(0.25, "quarter").is_ok());
        assert!(tracker.report(0.75, "three quarters").is_err());
        assert!(tracker.token().is_cancelled());
        // Further reports fail fast without calling back.
        assert!(tracker.report(0.9, "late").is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_report_is_throttled() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let callback: ProgressCallback = Box::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        let tracker = ProgressTracker::new(Stage::Filtering, CancellationToken::new(), Some(&callback))
            .with_interval(Duration::from_secs(3600));

        for i in 0..10 {
            tracker.report(i as f64 / 10.0, "step").unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tracker.report_now(1.0, "done").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
