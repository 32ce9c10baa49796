//! Progress reporting and confirmation checkpoints.
//!
//! A registration run reports progress once per cycle. A progress callback
//! returning `false` cancels the run at the next cycle boundary.
//!
//! Crossovers found after morphing can be put to the caller through a
//! [`ConfirmCallback`]: it receives a [`CrossoverCheckpoint`] and decides
//! whether the run continues.
//!
//! # Example
//!
//! ```ignore
//! use sphere_register::progress::{ConfirmCallback, ProgressCallback};
//!
//! let progress: ProgressCallback = Box::new(|p| {
//!     println!("{}% {}", p.percent(), p.message);
//!     true
//! });
//! let confirm: ConfirmCallback = Box::new(|checkpoint| checkpoint.nodes < 10);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Progress information passed to callbacks.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Completed steps.
    pub current: u64,

    /// Total number of steps.
    pub total: u64,

    /// What is happening now.
    pub message: String,

    pub elapsed: Duration,

    /// Estimated time remaining, once at least one step is done.
    pub estimated_remaining: Option<Duration>,
}

impl Progress {
    /// Create a progress report.
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
            elapsed: Duration::ZERO,
            estimated_remaining: None,
        }
    }

    /// Progress as a fraction (0.0 to 1.0).
    #[inline]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64) / (self.total as f64)
        }
    }

    /// Progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction() * 100.0).round() as u32
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Callback for progress reporting.
///
/// Returns `true` to continue, `false` to request cancellation.
pub type ProgressCallback = Box<dyn Fn(&Progress) -> bool + Send + Sync>;

/// Crossover state put to the caller for confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossoverCheckpoint {
    /// Stage number, 1-based. Zero for the end-of-run summary.
    pub stage: usize,
    /// Cycle number, 1-based. Zero for the end-of-run summary.
    pub cycle: usize,
    /// Crossover nodes found.
    pub nodes: usize,
    /// Crossover tiles found.
    pub tiles: usize,
    /// True for the confirmation asked once the whole run is done.
    pub final_summary: bool,
}

impl std::fmt::Display for CrossoverCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.final_summary {
            write!(f, "{} crossover nodes remain after registration", self.nodes)
        } else {
            write!(
                f,
                "{} crossover nodes after stage {} cycle {}",
                self.nodes, self.stage, self.cycle
            )
        }
    }
}

/// Callback deciding whether to continue despite crossovers.
///
/// Returns `true` to continue, `false` to abort the run.
pub type ConfirmCallback = Box<dyn Fn(&CrossoverCheckpoint) -> bool + Send + Sync>;

/// Thread-safe progress counter.
#[derive(Debug)]
pub struct ProgressTracker {
    current: AtomicU64,
    total: u64,
    cancelled: AtomicBool,
    start_time: Instant,
    /// Microseconds after `start_time` of the last callback.
    last_callback_us: AtomicU64,
    callback_interval: Duration,
}

impl ProgressTracker {
    /// Create a tracker that calls back at most every 100ms.
    pub fn new(total: u64) -> Self {
        Self::with_interval(total, Duration::from_millis(100))
    }

    /// Create a tracker with a custom callback interval.
    pub fn with_interval(total: u64, interval: Duration) -> Self {
        Self {
            current: AtomicU64::new(0),
            total,
            cancelled: AtomicBool::new(false),
            start_time: Instant::now(),
            last_callback_us: AtomicU64::new(0),
            callback_interval: interval,
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.current.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// True once a callback asked to stop or [`ProgressTracker::cancel`] ran.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Estimate remaining time from the rate so far.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let current = self.current();
        if current == 0 {
            return None;
        }
        let rate = current as f64 / self.elapsed().as_secs_f64();
        if rate > 0.0 {
            let remaining = self.total.saturating_sub(current) as f64 / rate;
            Some(Duration::from_secs_f64(remaining))
        } else {
            None
        }
    }

    /// Snapshot the tracker into a [`Progress`].
    pub fn snapshot(&self, message: impl Into<String>) -> Progress {
        Progress {
            current: self.current(),
            total: self.total,
            message: message.into(),
            elapsed: self.elapsed(),
            estimated_remaining: self.estimated_remaining(),
        }
    }

    /// Call the callback if enough time has passed since the last call.
    ///
    /// Returns `false` if the run was cancelled.
    pub fn maybe_callback(&self, callback: Option<&ProgressCallback>, message: impl Into<String>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let Some(callback) = callback else {
            return true;
        };

        let now_us = self.elapsed().as_micros() as u64;
        let last_us = self.last_callback_us.load(Ordering::Relaxed);
        let interval_us = self.callback_interval.as_micros() as u64;
        if last_us > 0 && now_us.saturating_sub(last_us) < interval_us {
            return true;
        }
        self.last_callback_us.store(now_us.max(1), Ordering::Relaxed);

        let should_continue = callback(&self.snapshot(message));
        if !should_continue {
            self.cancel();
        }
        should_continue
    }
}

/// Arc-wrapped tracker for sharing across threads.
pub type SharedProgressTracker = Arc<ProgressTracker>;

/// Create a shared progress tracker.
pub fn shared_tracker(total: u64) -> SharedProgressTracker {
    Arc::new(ProgressTracker::new(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_progress_fraction() {
        let p = Progress::new(50, 100, "test");
        assert!((p.fraction() - 0.5).abs() < 1e-10);
        assert_eq!(p.percent(), 50);
        assert!(!p.is_complete());
        assert!(Progress::new(100, 100, "done").is_complete());
    }

    #[test]
    fn test_progress_zero_total() {
        let p = Progress::new(0, 0, "empty");
        assert_eq!(p.fraction(), 0.0);
        assert_eq!(p.percent(), 0);
    }

    #[test]
    fn test_progress_tracker() {
        let tracker = ProgressTracker::new(4);
        tracker.increment();
        tracker.increment();
        assert_eq!(tracker.current(), 2);
        tracker.set(3);
        assert_eq!(tracker.snapshot("x").current, 3);
        assert!(!tracker.is_cancelled());
        tracker.cancel();
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_shared_tracker() {
        let tracker = shared_tracker(10);
        let clone = tracker.clone();
        tracker.increment();
        assert_eq!(clone.current(), 1);
    }

    #[test]
    fn test_callback_cancels() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let callback: ProgressCallback = Box::new(move |p| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            p.current < 3
        });

        let tracker = ProgressTracker::with_interval(10, Duration::ZERO);
        let mut stopped_at = None;
        for i in 0..10 {
            tracker.set(i);
            if !tracker.maybe_callback(Some(&callback), "cycle") {
                stopped_at = Some(i);
                break;
            }
        }
        assert_eq!(stopped_at, Some(3));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(!tracker.maybe_callback(Some(&callback), "after"));
    }

    #[test]
    fn test_checkpoint_display() {
        let checkpoint = CrossoverCheckpoint {
            stage: 2,
            cycle: 1,
            nodes: 7,
            tiles: 5,
            final_summary: false,
        };
        assert_eq!(checkpoint.to_string(), "7 crossover nodes after stage 2 cycle 1");
    }
}
