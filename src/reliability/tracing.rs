//! Structured logging setup.
//!
//! The search itself only emits `tracing` events; embedding applications call
//! [`init_tracing`] once to get them on the console.

use tracing::info;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

/// Configuration for the log subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name reported at startup.
    pub service_name: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
    /// Log level filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "tokenpass-decoder".to_string(),
            json: false,
            log_level: "info".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = Registry::default().with(env_filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        subscriber
            .with(fmt::layer().with_target(true).compact())
            .try_init()?;
    }

    info!(service = %config.service_name, "Tracing initialization completed");
    Ok(())
}

/// Create the span wrapping the decoding of one utterance.
#[macro_export]
macro_rules! decode_span {
    () => {
        tracing::info_span!(
            "decode",
            frames = tracing::field::Empty,
            active_tokens = tracing::field::Empty,
            complete = tracing::field::Empty,
        )
    };
    ($($key:ident = $value:expr),+) => {
        tracing::info_span!(
            "decode",
            frames = tracing::field::Empty,
            active_tokens = tracing::field::Empty,
            complete = tracing::field::Empty,
            $($key = $value),+
        )
    };
}
