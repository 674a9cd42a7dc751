use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG: &str = "DRIVEDECK_LOG";
pub const ENV_LOG_FORMAT: &str = "DRIVEDECK_LOG_FORMAT";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects NDJSON; anything else is text.
    pub fn from_env_or(default: LogFormat) -> Self {
        match std::env::var(ENV_LOG_FORMAT) {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Ok(v) if v.eq_ignore_ascii_case("text") => LogFormat::Text,
            _ => default,
        }
    }
}

fn build_env_filter_from(
    drivedeck_log: Option<&str>,
    rust_log: Option<&str>,
    default_directive: &str,
) -> EnvFilter {
    let default = || EnvFilter::new(default_directive);

    if let Some(v) = drivedeck_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter(default_directive: &str) -> EnvFilter {
    build_env_filter_from(
        std::env::var(ENV_LOG).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        default_directive,
    )
}

/// Logs go to stderr so stdout stays free for command output and NDJSON events.
pub fn init_logging(format: LogFormat) {
    init_logging_with_default(format, "info");
}

/// Like [`init_logging`], with a different level when neither env var is set.
pub fn init_logging_with_default(format: LogFormat, default_directive: &str) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter(default_directive);
        let registry = tracing_subscriber::registry().with(env_filter);

        let _ = match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
    });
}
