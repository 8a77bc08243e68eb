//! Log subscriber setup
//!
//! Components log through `tracing` macros with structured fields. This
//! module only installs the global subscriber: a `fmt` layer filtered by
//! `RUST_LOG` when set, otherwise by the configured level.
//!
//! Level names follow the configuration vocabulary
//! (`debug|info|warn|error|fatal|panic`). `fatal` and `panic` have no
//! tracing counterpart and filter like `error`; nothing in this crate exits
//! or panics because of a log level.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::prelude::*;

use crate::config::LogSettings;
use crate::kafka::error::KafkaError;

/// Configured log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = KafkaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            "panic" => Ok(LogLevel::Panic),
            other => Err(KafkaError::Config(format!("unknown log level '{}'", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Panic => "panic",
        };
        f.write_str(name)
    }
}

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed; that is not an
/// error, the existing one keeps receiving events.
pub fn init(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber_fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// Install the global subscriber from the `[log]` section
pub fn init_from(settings: &LogSettings) -> bool {
    init(settings.level())
}
