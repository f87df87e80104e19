use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use crate::util::parse_bool_str;

static INIT: OnceLock<()> = OnceLock::new();

const LOG_FILTER_ENV: &str = "ASKSTREAM_LOG";
const LOG_ENABLED_ENV: &str = "ASKSTREAM_LOG_ENABLED";

fn logging_enabled() -> bool {
    std::env::var(LOG_ENABLED_ENV)
        .ok()
        .and_then(|value| parse_bool_str(&value))
        .unwrap_or(true)
}

fn resolve_env_filter() -> EnvFilter {
    if let Some(filter) = std::env::var(LOG_FILTER_ENV)
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the process-wide subscriber once.
///
/// Environment variables:
/// - `ASKSTREAM_LOG_ENABLED`: set to `false` to install nothing.
/// - `ASKSTREAM_LOG`: filter override (`info`, `askstream=debug`, ...).
/// - `RUST_LOG`: used when `ASKSTREAM_LOG` is unset or invalid.
///
/// Logs go to stderr; stdout carries frames.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        if !logging_enabled() {
            return;
        }

        let console_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(resolve_env_filter())
            .with(console_layer)
            .try_init();
    });
}
