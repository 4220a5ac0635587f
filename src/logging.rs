use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Used when `RUST_LOG` is unset or unparsable. The AMQP client is chatty at
/// info level about channel lifecycle.
pub const DEFAULT_FILTER: &str = "info,lapin=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `json` (any case) selects JSON; everything else is pretty.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|value| Self::parse(&value))
            .unwrap_or(LogFormat::Json)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn output_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        // One object per line for log shippers.
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_target(false).boxed(),
    }
}

/// Install the global subscriber.
///
/// # Errors
/// Fails if a global subscriber is already set.
pub fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(output_layer(format))
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")
}
