//! Session metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless a
//! recorder is installed (see [`init_metrics_exporter`]).
//!
//! # Metrics
//!
//! - `relay_sessions_started_total`: Counter of accepted sessions
//! - `relay_sessions_finished_total`: Counter of finished sessions by outcome
//! - `relay_session_duration_seconds`: Histogram of session duration by outcome
//! - `relay_session_chunks`: Histogram of chunks per finished session
//! - `relay_chunks_total`: Counter of chunks relayed
//! - `relay_protocol_warnings_total`: Counter of skipped malformed records
//! - `relay_sessions_active`: Gauge of live sessions
//!
//! # Examples
//!
//! ```
//! use storyrelay::metrics::SessionMetrics;
//!
//! let metrics = SessionMetrics::new("gpt-4o-mini");
//! metrics.record_finish("completed", 12);
//! ```

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Metrics for one session
///
/// Bumps the active gauge on creation and settles it exactly once, either
/// through [`record_finish`](Self::record_finish) or on drop.
#[derive(Debug)]
pub struct SessionMetrics {
    model: String,
    start: Instant,
    recorded: AtomicBool,
}

impl SessionMetrics {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        increment_counter!("relay_sessions_started_total", "model" => model.clone());
        increment_gauge!("relay_sessions_active", 1.0);

        Self {
            model,
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Record the terminal outcome; later calls are ignored
    pub fn record_finish(&self, outcome: &str, chunks: u64) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        histogram!(
            "relay_session_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "outcome" => outcome.to_string()
        );
        histogram!(
            "relay_session_chunks",
            chunks as f64,
            "model" => self.model.clone()
        );
        increment_counter!(
            "relay_sessions_finished_total",
            "outcome" => outcome.to_string(),
            "model" => self.model.clone()
        );
        decrement_gauge!("relay_sessions_active", 1.0);
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for SessionMetrics {
    fn drop(&mut self) {
        if !self.is_recorded() {
            increment_counter!(
                "relay_sessions_finished_total",
                "outcome" => "abandoned",
                "model" => self.model.clone()
            );
            decrement_gauge!("relay_sessions_active", 1.0);
        }
    }
}

/// Count one relayed chunk
pub fn record_chunk() {
    increment_counter!("relay_chunks_total");
}

/// Count one malformed upstream record
pub fn record_protocol_warning() {
    increment_counter!("relay_protocol_warnings_total");
}

/// Install the Prometheus exporter when built with the `prometheus` feature
///
/// A no-op otherwise. Must run inside a tokio runtime.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}
