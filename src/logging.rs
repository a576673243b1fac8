//! Structured logging setup.
//!
//! One `tracing-subscriber` registry with an `EnvFilter` and a single fmt
//! layer (JSON or pretty). Output always goes through a non-blocking
//! `tracing-appender` writer; keep the returned guard alive until exit.
//!
//! Per-cell style diagnostics use the `spreadsheet_worker::style_debug`
//! target and stay off unless `RUST_LOG` enables them.

use crate::model::WorkbookKey;
use crate::protocol::RequestId;
use crate::styles::STYLE_DEBUG_TARGET;
use anyhow::{Context, Result};
use std::env;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use strum::{EnumString, IntoStaticStr};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Rolling file under `log_dir`
    File,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    pub log_dir: PathBuf,
    pub file_prefix: String,
    /// Start a new file every day instead of appending forever
    pub daily_rotation: bool,
    /// Level for this crate when `RUST_LOG` is unset
    pub default_level: tracing::Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            output: LogOutput::Stderr,
            log_dir: PathBuf::from("logs"),
            file_prefix: env!("CARGO_PKG_NAME").to_string(),
            daily_rotation: true,
            default_level: tracing::Level::INFO,
        }
    }
}

impl LoggingConfig {
    /// Defaults overridden by `LOG_FORMAT`, `LOG_OUTPUT`, `LOG_DIR` and
    /// `LOG_LEVEL`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(format) = env_parse("LOG_FORMAT") {
            config.format = format;
        }
        if let Some(output) = env_parse("LOG_OUTPUT") {
            config.output = output;
        }
        if let Ok(dir) = env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(level) = env_parse("LOG_LEVEL") {
            config.default_level = level;
        }
        config
    }

    /// Filter used when `RUST_LOG` is not set
    pub fn default_filter(&self) -> String {
        let level = self.default_level.as_str().to_ascii_lowercase();
        format!("warn,spreadsheet_worker={level},umya_spreadsheet=warn,{STYLE_DEBUG_TARGET}=off")
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn make_writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(match config.output {
        LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogOutput::File => {
            std::fs::create_dir_all(&config.log_dir)
                .with_context(|| format!("failed to create log directory {:?}", config.log_dir))?;
            let rotation = if config.daily_rotation {
                Rotation::DAILY
            } else {
                Rotation::NEVER
            };
            let appender = RollingFileAppender::new(rotation, &config.log_dir, &config.file_prefix);
            tracing_appender::non_blocking(appender)
        }
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));
    let (writer, guard) = make_writer(&config)?;
    let ansi = config.output != LogOutput::File;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .context("a global subscriber is already installed")?;

    tracing::debug!(
        format = <&'static str>::from(config.format),
        output = <&'static str>::from(config.output),
        version = env!("CARGO_PKG_VERSION"),
        "logging initialized"
    );
    Ok(guard)
}

/// Span covering work on one workbook
pub fn workbook_span(key: &WorkbookKey) -> tracing::Span {
    tracing::info_span!("workbook", workbook = %key)
}

/// Span covering one worker request
pub fn request_span(id: RequestId, request: &'static str) -> tracing::Span {
    tracing::debug_span!("request", request_id = id, request)
}
