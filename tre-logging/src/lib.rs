//! Tracing subscriber setup shared by the TRE binaries
//!
//! Configured from the environment:
//!
//! - `TRE_LOG_LEVEL`: filter directive, e.g. `info` or `tre_orchestrator=debug` (default `info`).
//!   `RUST_LOG` takes precedence when set.
//! - `TRE_LOG_FORMAT`: `human` or `json` (default `human`)
//! - `TRE_LOG_OUTPUT`: `console`, `file` or `both` (default `console`)
//! - `TRE_LOG_FILE`: path of the daily rolling log file (default `logs/tre-worker.log`)

use std::env;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{prelude::*, registry, EnvFilter, Layer, Registry};

const DEFAULT_LOG_FILE: &str = "logs/tre-worker.log";

/// Crates that are too chatty at `info`
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "tokio=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file: PathBuf,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Unknown values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let format = match lookup("TRE_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let output = match lookup("TRE_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };

        Self {
            level: lookup("TRE_LOG_LEVEL")
                .filter(|level| !level.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            format,
            output,
            file: lookup("TRE_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        }
    }

    fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
        directives.join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.filter_directives()))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }

    fn file_parts(&self) -> (&Path, &Path) {
        let dir = self
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = self
            .file
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("tre-worker.log"));
        (dir, name)
    }
}

/// Initializes the global tracing subscriber from `TRE_LOG_*` variables.
///
/// Keep the returned guard alive for the life of the process when logging
/// to a file, or buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut guard = None;

    let file_writer = if settings.output.file() {
        let (dir, name) = settings.file_parts();
        let appender = tracing_appender::rolling::daily(dir, name);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        Some(non_blocking)
    } else {
        None
    };

    let writer = match (settings.output.console(), file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(file)),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (_, None) => BoxMakeWriter::new(std::io::stdout),
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Json => fmt_layer.json().with_current_span(true).boxed(),
        LogFormat::Human => fmt_layer.with_target(true).boxed(),
    };

    registry()
        .with(fmt_layer)
        .with(settings.env_filter())
        .init();

    guard
}
