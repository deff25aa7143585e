//! Observability for the search: structured logging and metrics.

pub mod metrics;
pub mod tracing;

pub use self::metrics::{describe_metrics, DecoderMetrics, MetricsTimer};
pub use self::tracing::{init_tracing, TracingConfig};
