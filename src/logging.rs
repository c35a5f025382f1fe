// src/logging.rs

//! Logging capability and subscriber initialisation.
//!
//! Components never reach for an implicit global logger. They are handed a
//! [`Logger`] at construction time and open their spans from it, so every
//! event carries the `component` (and, where relevant, `vm_id`) that produced
//! it. [`Logger::global`] exists as a convenience fallback for code paths that
//! were not given one.

use std::path::Path;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LogLevel, LoggingConfig};

static GLOBAL_LOGGER: Lazy<Logger> = Lazy::new(|| Logger::new("agni"));

/// Explicitly passed logging capability
///
/// Cloning is cheap: the underlying span is reference counted by the
/// subscriber.
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Creates a root logger for the given component
    pub fn new(component: &'static str) -> Self {
        Self {
            span: tracing::info_span!("agni", component = component),
        }
    }

    /// Lazily initialised fallback logger
    pub fn global() -> &'static Logger {
        &GLOBAL_LOGGER
    }

    /// Derives a logger for a sub-component
    pub fn with_component(&self, component: &'static str) -> Logger {
        Logger {
            span: tracing::info_span!(parent: &self.span, "component", component = component),
        }
    }

    /// The span events should be recorded under
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// A span scoped to one VM identity
    pub fn vm_span(&self, vm_id: &str) -> Span {
        tracing::info_span!(parent: &self.span, "vm", vm_id = %vm_id)
    }

    /// A span scoped to one user identity
    pub fn user_span(&self, user_id: &str) -> Span {
        tracing::info_span!(parent: &self.span, "user", user_id = %user_id)
    }
}

/// Keeps the non-blocking file writer alive; drop it only at process exit
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Errors raised while installing the global subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log file path: {0}")]
    InvalidPath(String),

    #[error("Failed to create log directory {path}: {error}")]
    CreateDir {
        path: String,
        error: std::io::Error,
    },

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
        LogFormat::Plain => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

/// Installs the process-wide tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<LogGuard, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_stdout {
        layers.push(format_layer(config.format, std::io::stdout, true));
    }

    let mut file_guard = None;
    if config.log_to_file {
        let file = config
            .log_file
            .as_deref()
            .ok_or_else(|| LoggingError::InvalidPath("log_file is not set".to_string()))?;

        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| LoggingError::InvalidPath(file.to_string()))?;

        std::fs::create_dir_all(dir).map_err(|error| LoggingError::CreateDir {
            path: dir.display().to_string(),
            error,
        })?;

        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config.format, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
