//! Metrics for the search index synchronizer
//!
//! Provides Prometheus-compatible metrics through the `metrics` facade.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Bootstrap metrics
    pub const BOOTSTRAP_RUNS: &str = "search_sync_bootstrap_runs_total";
    pub const BOOTSTRAP_ITEMS_LOADED: &str = "search_sync_bootstrap_items_loaded_total";
    pub const BOOTSTRAP_DURATION: &str = "search_sync_bootstrap_duration_seconds";
    pub const UPSTREAM_FETCH_FAILURES: &str = "search_sync_upstream_fetch_failures_total";
    pub const UPSTREAM_ESCALATIONS: &str = "search_sync_upstream_escalations_total";

    // Consumer metrics
    pub const NOTIFICATIONS_APPLIED: &str = "search_sync_notifications_applied_total";
    pub const NOTIFICATION_LATENCY: &str = "search_sync_notification_latency_seconds";
    pub const HANDLER_RETRIES: &str = "search_sync_handler_retries_total";
    pub const DEAD_LETTERED: &str = "search_sync_dead_lettered_total";
    pub const DEAD_LETTER_SIZE: &str = "search_sync_dead_letter_size";
    pub const POISON_MESSAGES: &str = "search_sync_poison_messages_total";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const KIND: &str = "kind";
    pub const OUTCOME: &str = "outcome";
    pub const FAILURE: &str = "failure";
}

/// Bootstrap metrics
#[derive(Clone)]
pub struct BootstrapMetrics {
    component: String,
}

impl BootstrapMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a finished bootstrap run
    pub fn record_run(&self, outcome: &str, duration: Duration) {
        counter!(
            names::BOOTSTRAP_RUNS,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::BOOTSTRAP_DURATION,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record items written by a bulk load or catch-up
    pub fn record_items_loaded(&self, count: u64) {
        counter!(
            names::BOOTSTRAP_ITEMS_LOADED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(count);
    }

    /// Record a failed upstream fetch attempt
    pub fn record_fetch_failure(&self, failure: &str) {
        counter!(
            names::UPSTREAM_FETCH_FAILURES,
            labels::COMPONENT => self.component.clone(),
            labels::FAILURE => failure.to_string(),
        )
        .increment(1);
    }

    /// Record that the fetch has been stuck beyond the escalation threshold
    pub fn record_escalation(&self) {
        counter!(
            names::UPSTREAM_ESCALATIONS,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }
}

/// Consumer metrics
#[derive(Clone)]
pub struct ConsumerMetrics {
    component: String,
}

impl ConsumerMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record an applied notification
    pub fn record_applied(&self, kind: &str, outcome: &str) {
        counter!(
            names::NOTIFICATIONS_APPLIED,
            labels::COMPONENT => self.component.clone(),
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record handler latency
    pub fn record_latency(&self, duration: Duration) {
        histogram!(
            names::NOTIFICATION_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record retry
    pub fn record_retry(&self, kind: &str) {
        counter!(
            names::HANDLER_RETRIES,
            labels::COMPONENT => self.component.clone(),
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Record a dead-lettered message
    pub fn record_dead_lettered(&self, kind: &str) {
        counter!(
            names::DEAD_LETTERED,
            labels::COMPONENT => self.component.clone(),
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Set DLQ size
    pub fn set_dead_letter_size(&self, size: usize) {
        gauge!(
            names::DEAD_LETTER_SIZE,
            labels::COMPONENT => self.component.clone(),
        )
        .set(size as f64);
    }

    /// Record a message that could not be decoded
    pub fn record_poison(&self) {
        counter!(
            names::POISON_MESSAGES,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Get elapsed time without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
