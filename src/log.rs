//! Logging from greylag.

use std::io;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, LogTarget, LoggingConfig};

/// Set up the global logger from the configuration.
///
/// ## Panics
///
/// Panics if a global [`tracing`] subscriber has been set already.
pub fn setup(config: &LoggingConfig) -> Result<(), String> {
    // An EnvFilter which won't read any env vars; the configured level is
    // its only directive.
    let filter =
        EnvFilter::default().add_directive(LevelFilter::from(config.level).into());

    match &config.target {
        LogTarget::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_std_path())
                .map_err(|err| format!("cannot open log file '{path}': {err}"))?;

            // We never emit colors to files.
            let layer = FmtLayer::new().with_ansi(false).with_writer(file);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
        LogTarget::Stdout => {
            // We try to determine whether to use colors in a bit more fancy
            // way than tracing does automatically (it only does `NO_COLOR`).
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                .with_writer(io::stdout);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
        LogTarget::Stderr => {
            let layer = FmtLayer::new()
                .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                .with_writer(io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).init()
        }
    }

    Ok(())
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}
