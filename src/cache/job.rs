//! Background generation job state.
//!
//! Cache generation runs as a fire-and-forget task with observable status.
//! The job guard is the process-wide single-flight for generation: a second
//! start while one is running is rejected, never queued.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

/// Observable state of the generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    /// No generation has run yet (or state was reset).
    Idle,
    /// A generation pass is in progress.
    Running,
    /// The last pass completed.
    Done,
    /// The last pass failed or was cancelled.
    Failed(String),
}

/// Counters from a completed generation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    /// Images embedded this pass.
    pub embedded: usize,
    /// Images skipped because their fingerprint matched.
    pub skipped: usize,
    /// Entries pruned for images no longer in the corpus.
    pub pruned: usize,
}

/// Single-flight guard and status holder for cache generation.
#[derive(Debug)]
pub struct GenerationJob {
    running: AtomicBool,
    status: RwLock<GenerationStatus>,
    cancel: RwLock<CancellationToken>,
    embedded: AtomicUsize,
    skipped: AtomicUsize,
}

impl Default for GenerationJob {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            status: RwLock::new(GenerationStatus::Idle),
            cancel: RwLock::new(CancellationToken::new()),
            embedded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }
}

impl GenerationJob {
    /// Creates an idle job.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim the job. Returns false when a pass is already
    /// running.
    pub fn try_begin(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.embedded.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        *self.cancel.write().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.set_status(GenerationStatus::Running);
        true
    }

    /// Marks the pass finished and records the outcome.
    pub fn finish(&self, outcome: Result<(), String>) {
        let status = match outcome {
            Ok(()) => GenerationStatus::Done,
            Err(reason) => GenerationStatus::Failed(reason),
        };
        self.set_status(status);
        self.running.store(false, Ordering::Release);
    }

    /// Whether a pass is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current observable status.
    pub fn status(&self) -> GenerationStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Token checked between corpus items for cooperative cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests cancellation of the running pass.
    pub fn request_cancel(&self) {
        self.cancel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    /// Records one embedded image.
    pub fn count_embedded(&self) {
        self.embedded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one skipped image.
    pub fn count_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Progress counters for the current or last pass.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.embedded.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }

    fn set_status(&self, status: GenerationStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}
