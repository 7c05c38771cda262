//! Operational counters for the redemption engine.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated metrics across all runs since start-up.
///
/// Thread-safe via atomics; shared via `Arc<Metrics>`.
pub struct Metrics {
    /// Batch runs started (transactional and non-transactional).
    pub runs_started: AtomicU64,
    /// Batch runs aborted by an infrastructure error.
    pub runs_failed: AtomicU64,
    /// Batch runs currently executing.
    pub runs_in_progress: AtomicU64,
    /// Subscriptions that reached the executor.
    pub redemptions_attempted: AtomicU64,
    /// Redemptions confirmed on-chain.
    pub redemptions_succeeded: AtomicU64,
    /// Subscriptions completed by their final payment.
    pub completions: AtomicU64,
    /// Redemptions that failed after retries, or could not be prepared.
    pub redemptions_failed: AtomicU64,
    /// Redemptions that moved funds but could not be recorded.
    pub bookkeeping_failures: AtomicU64,
    /// Sum of successful redemption latencies in milliseconds, retries included.
    pub redemption_latency_sum_ms: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_in_progress: AtomicU64::new(0),
            redemptions_attempted: AtomicU64::new(0),
            redemptions_succeeded: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            redemptions_failed: AtomicU64::new(0),
            bookkeeping_failures: AtomicU64::new(0),
            redemption_latency_sum_ms: AtomicU64::new(0),
        }
    }

    /// Mark a batch run as started. The guard marks it finished when dropped.
    pub fn start_run(&self) -> RunGuard<'_> {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        self.runs_in_progress.fetch_add(1, Ordering::Relaxed);
        RunGuard { metrics: self }
    }

    pub fn record_run_failure(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self) {
        self.redemptions_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful redemption with its latency.
    pub fn record_redemption(&self, latency_ms: u64) {
        self.redemptions_succeeded.fetch_add(1, Ordering::Relaxed);
        self.redemption_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.redemptions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bookkeeping_failure(&self) {
        self.bookkeeping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn runs_in_progress(&self) -> u64 {
        self.runs_in_progress.load(Ordering::Relaxed)
    }

    /// Average successful redemption latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.redemptions_succeeded.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.redemption_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "runs_started": self.runs_started.load(Ordering::Relaxed),
            "runs_failed": self.runs_failed.load(Ordering::Relaxed),
            "runs_in_progress": self.runs_in_progress(),
            "redemptions_attempted": self.redemptions_attempted.load(Ordering::Relaxed),
            "redemptions_succeeded": self.redemptions_succeeded.load(Ordering::Relaxed),
            "completions": self.completions.load(Ordering::Relaxed),
            "redemptions_failed": self.redemptions_failed.load(Ordering::Relaxed),
            "bookkeeping_failures": self.bookkeeping_failures.load(Ordering::Relaxed),
            "avg_redemption_latency_ms": self.avg_latency_ms(),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-progress run count on drop, including on cancellation.
pub struct RunGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.metrics.runs_in_progress.fetch_sub(1, Ordering::Relaxed);
    }
}
