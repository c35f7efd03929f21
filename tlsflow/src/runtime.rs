use std::{error::Error, fmt};

use clap::Parser;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{Layer, format::FmtSpan},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use crate::runtime::{
    cli::Cli,
    conf::{Conf, ConfigError},
};

pub mod cli;
pub mod conf;

pub struct Runtime {
    pub cli: Cli,
    pub config: Conf,
}

impl Runtime {
    pub fn new() -> Result<Self, RuntimeError> {
        let cli = Cli::parse();
        let (config, cli) = Conf::new(cli)?;

        Ok(Runtime { cli, config })
    }
}

/// Install the global tracing subscriber.
///
/// Only `tlsflow` events at `log_level` and above are shown; other crates are
/// held at `warn`. Set `NO_COLOR` to disable ANSI colors.
pub fn init_tracing(log_level: Level) {
    let mut fmt_layer = Layer::new()
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(std::env::var("NO_COLOR").is_err());

    match log_level {
        Level::DEBUG => fmt_layer = fmt_layer.with_file(true).with_line_number(true),
        Level::TRACE => {
            fmt_layer = fmt_layer
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        }
        _ => {}
    }

    tracing_subscriber::registry()
        .with(EnvFilter::new(format!("warn,tlsflow={log_level}")))
        .with(fmt_layer)
        .init();
}

#[derive(Debug)]
pub enum RuntimeError {
    Config(ConfigError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Config(e) => e.fmt(f),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeError::Config(e) => Some(e),
        }
    }
}

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> Self {
        RuntimeError::Config(e)
    }
}
