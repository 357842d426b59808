//! Process-level logging initialization.
//!
//! Configuration comes from environment variables, optionally layered over a
//! TOML file:
//!   - `TOLLGATE_LOG` sets the filter (standard `EnvFilter` syntax);
//!   - `TOLLGATE_LOG_JSONL=1` switches output to JSON lines;
//!   - `TOLLGATE_LOGGING_CONFIG_PATH` points at a TOML file with `log_level`
//!     and a `[log_filters]` table of per-module overrides.

use std::collections::HashMap;
use std::sync::Once;

use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const FILTER_ENV: &str = "TOLLGATE_LOG";
const JSONL_ENV: &str = "TOLLGATE_LOG_JSONL";
const CONFIG_PATH_ENV: &str = "TOLLGATE_LOGGING_CONFIG_PATH";

static INIT: Once = Once::new();

#[derive(Debug, Serialize, Deserialize)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            // Quiet down the transport internals by default.
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("tonic".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Initializes the global tracing subscriber. Safe to call more than once;
/// only the first call has any effect.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = filters(load_config());
    if jsonl_enabled() {
        let layer = fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .with_timer(TimeFormatter)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    } else {
        let layer = fmt::layer()
            .compact()
            .with_timer(TimeFormatter)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).init();
    }
}

fn jsonl_enabled() -> bool {
    std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false)
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));
    figment.extract().unwrap_or_else(|err| {
        eprintln!("failed to load logging config: {err}");
        LoggingConfig::default()
    })
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(err) => eprintln!("bad filter '{level}' for module '{module}': {err}"),
        }
    }
    filter
}

struct TimeFormatter;

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}
