use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::passway::config;

/// Keeps the non-blocking writer flushing; hold it for the life of the process.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();
    let out = logging.output.trim();

    // RUST_LOG wins over the URL's `log` level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive_for(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(out)?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && LogSink::parse(out) == LogSink::Stderr)
        .with_target(false)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: subscriber already installed")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// Filter directive for a configured level. Dependencies stay at `warn` so a
/// `debug` client does not drown in TLS handshake chatter.
fn directive_for(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    };
    format!("warn,passway={level}")
}

/// Where formatted log lines go, from the URL `log_output` option.
#[derive(Debug, PartialEq, Eq)]
enum LogSink<'a> {
    Stderr,
    Stdout,
    Discard,
    File(&'a Path),
}

impl<'a> LogSink<'a> {
    fn parse(output: &'a str) -> Self {
        match output {
            "" | "stderr" => LogSink::Stderr,
            "stdout" => LogSink::Stdout,
            "discard" => LogSink::Discard,
            path => LogSink::File(Path::new(path)),
        }
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let pair = match LogSink::parse(output) {
        LogSink::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogSink::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogSink::Discard => tracing_appender::non_blocking(io::sink()),
        LogSink::File(path) => tracing_appender::non_blocking(file_appender(path)?),
    };
    Ok(pair)
}

/// Append-only log file; missing parent directories are created.
fn file_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("logging: log_output {} is not a file path", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .with_context(|| format!("logging: open log file {}", path.display()))
}
