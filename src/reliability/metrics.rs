//! Search metrics collection and Prometheus export.
//!
//! Recording is a no-op until a recorder is installed, so the search records
//! unconditionally once per frame.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, info};

use crate::error::{DecoderError, Result};

pub const FRAMES_TOTAL: &str = "tokenpass_frames_total";
pub const ACTIVE_TOKENS: &str = "tokenpass_active_tokens";
pub const PRUNED_TOKENS_TOTAL: &str = "tokenpass_pruned_tokens_total";
pub const HISTOGRAM_PRUNES_TOTAL: &str = "tokenpass_histogram_prunes_total";
pub const CURRENT_BEAM: &str = "tokenpass_current_beam";
pub const LM_CACHE_HITS_TOTAL: &str = "tokenpass_lm_cache_hits_total";
pub const LM_CACHE_MISSES_TOTAL: &str = "tokenpass_lm_cache_misses_total";
pub const LM_CACHE_COLLISIONS_TOTAL: &str = "tokenpass_lm_cache_collisions_total";
pub const LOOKAHEAD_COMPUTATIONS_TOTAL: &str = "tokenpass_lookahead_computations_total";
pub const TOKEN_POOL_CAPACITY: &str = "tokenpass_token_pool_capacity";
pub const DECODE_DURATION_SECONDS: &str = "tokenpass_decode_duration_seconds";

/// Prometheus recorder for the decoder metrics.
pub struct DecoderMetrics {
    prometheus_handle: PrometheusHandle,
}

impl DecoderMetrics {
    /// Install the global Prometheus recorder and describe all metrics.
    pub fn install() -> Result<Self> {
        let prometheus_handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| DecoderError::Config(format!("Failed to install metrics recorder: {}", e)))?;

        describe_metrics();
        info!("Metrics collection initialized");

        Ok(Self { prometheus_handle })
    }

    /// Get the Prometheus metrics as a string.
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Register descriptions for every decoder metric.
pub fn describe_metrics() {
    describe_counter!(FRAMES_TOTAL, "Total number of frames processed by the search");
    describe_gauge!(ACTIVE_TOKENS, "Number of active tokens after pruning");
    describe_counter!(PRUNED_TOKENS_TOTAL, "Total number of tokens discarded by pruning");
    describe_counter!(
        HISTOGRAM_PRUNES_TOTAL,
        "Total number of frames where histogram pruning narrowed the beam"
    );
    describe_gauge!(CURRENT_BEAM, "Current adaptive global beam width");
    describe_counter!(LM_CACHE_HITS_TOTAL, "LM score cache hits");
    describe_counter!(LM_CACHE_MISSES_TOTAL, "LM score cache misses");
    describe_counter!(
        LM_CACHE_COLLISIONS_TOTAL,
        "LM score cache hash collisions evicted and recomputed"
    );
    describe_counter!(
        LOOKAHEAD_COMPUTATIONS_TOTAL,
        "Lookahead score vectors computed from the lookahead language model"
    );
    describe_gauge!(TOKEN_POOL_CAPACITY, "Number of token slots allocated by the pool");
    describe_histogram!(
        DECODE_DURATION_SECONDS,
        "Duration of decoding one utterance in seconds"
    );
}

/// Record the outcome of one frame's pruning pass.
pub fn record_frame(active_tokens: usize, pruned: usize, current_beam: f32, histogram_pruned: bool) {
    counter!(FRAMES_TOTAL).increment(1);
    gauge!(ACTIVE_TOKENS).set(active_tokens as f64);
    counter!(PRUNED_TOKENS_TOTAL).increment(pruned as u64);
    gauge!(CURRENT_BEAM).set(current_beam as f64);
    if histogram_pruned {
        counter!(HISTOGRAM_PRUNES_TOTAL).increment(1);
    }
}

/// Record cache activity since the previous call.
pub fn record_cache_activity(lm_hits: u64, lm_misses: u64, lm_collisions: u64, lookahead_computations: u64) {
    counter!(LM_CACHE_HITS_TOTAL).increment(lm_hits);
    counter!(LM_CACHE_MISSES_TOTAL).increment(lm_misses);
    counter!(LM_CACHE_COLLISIONS_TOTAL).increment(lm_collisions);
    counter!(LOOKAHEAD_COMPUTATIONS_TOTAL).increment(lookahead_computations);
}

/// Record the token pool size.
pub fn record_pool_capacity(capacity: usize) {
    gauge!(TOKEN_POOL_CAPACITY).set(capacity as f64);
}

/// Timer for measuring operation durations.
pub struct MetricsTimer {
    name: &'static str,
    start: Instant,
}

impl MetricsTimer {
    /// Create a new timer for the given metric.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Record the elapsed time and drop the timer.
    pub fn finish(self) {
        // Drop records.
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let duration = self.start.elapsed();
            histogram!(self.name).record(duration.as_secs_f64());
            debug!("Recorded metric '{}': {:.3}ms", self.name, duration.as_secs_f64() * 1e3);
        }
    }
}
