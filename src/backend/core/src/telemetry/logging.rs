//! Structured logging.
//!
//! JSON output in production, pretty output in development, with
//! per-module level overrides on top of the global filter. Credentials are
//! never passed to the logging macros; events carry user, character and
//! permission identifiers only.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// module path → level
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Include file and line of each event
    #[serde(default)]
    pub include_location: bool,

    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Emit an event when spans close (with busy/idle timings)
    #[serde(default)]
    pub span_close_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_target: default_include_target(),
            span_close_events: false,
        }
    }
}

impl LoggingConfig {
    /// The global level plus one directive per module override.
    pub fn filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (module, level) in &self.module_levels {
            filter = filter.add_directive(format!("{}={}", module, level).parse()?);
        }
        Ok(filter)
    }

    /// Format in effect for `environment`. Development swaps the JSON
    /// default for pretty output.
    pub fn effective_format(&self, environment: &str) -> LogFormat {
        match (&self.format, environment) {
            (LogFormat::Json, "development") => LogFormat::Pretty,
            (format, _) => format.clone(),
        }
    }

    fn fmt_layer<S>(&self, environment: &str) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        let span_events = if self.span_close_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target);

        match self.effective_format(environment) {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    /// Single line per event
    Compact,
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_target() -> bool {
    true
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directives are invalid or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let filter = config.filter()?;
    tracing_subscriber::registry()
        .with(filter)
        .with(config.fmt_layer(environment))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.include_location);
        assert!(!config.span_close_events);
    }

    #[test]
    fn test_development_prefers_pretty() {
        let config = LoggingConfig::default();
        assert_eq!(config.effective_format("development"), LogFormat::Pretty);
        assert_eq!(config.effective_format("production"), LogFormat::Json);

        let compact = LoggingConfig {
            format: LogFormat::Compact,
            ..LoggingConfig::default()
        };
        assert_eq!(compact.effective_format("development"), LogFormat::Compact);
    }

    #[test]
    fn test_module_levels_become_directives() {
        let mut config = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        config.module_levels.insert("keystone_core::guard".into(), "debug".into());
        let rendered = config.filter().unwrap().to_string();
        assert!(rendered.contains("keystone_core::guard=debug"));
        assert!(rendered.contains("warn"));

        config.module_levels.insert("keystone_core::cache".into(), "loud".into());
        assert!(config.filter().is_err());
    }
}
