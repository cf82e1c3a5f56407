//! Tracing setup for the `deskpack` binary.
//!
//! `serve` and `build` can run for minutes and interleave interpreter or
//! toolchain output with engine records, so when `logging.to_file` is set
//! they write to `<state>/logs/deskpack-<stamp>.log`. Short commands always
//! log to stderr.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Where records end up for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogSink {
    Stderr,
    File { dir: PathBuf, name: String },
}

fn choose_sink(config: &Config, long_running: bool) -> LogSink {
    if !(long_running && config.logging.to_file) {
        return LogSink::Stderr;
    }
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    LogSink::File {
        dir: config.logs_path(),
        name: format!("deskpack-{}.log", stamp),
    }
}

/// `RUST_LOG` beats `--debug`, which beats `logging.level`
fn filter_directive(config: &Config, debug: bool, rust_log: Option<String>) -> String {
    rust_log.unwrap_or_else(|| {
        if debug {
            "debug".to_string()
        } else {
            config.logging.level.clone()
        }
    })
}

/// Keeps the file writer alive; drop it last so buffered records are flushed
pub struct LoggingHandle {
    _guard: Option<WorkerGuard>,
    pub log_file_path: Option<PathBuf>,
}

/// Install the global subscriber for a `deskpack` command.
///
/// `long_running` is true for `serve` and `build`.
pub fn init_logging(config: &Config, long_running: bool, debug: bool) -> Result<LoggingHandle> {
    let filter = EnvFilter::new(filter_directive(
        config,
        debug,
        std::env::var("RUST_LOG").ok(),
    ));

    match choose_sink(config, long_running) {
        LogSink::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
            Ok(LoggingHandle {
                _guard: None,
                log_file_path: None,
            })
        }
        LogSink::File { dir, name } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));

            // Targets stay on so interpreter lines (target dev_server) stand out
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(LoggingHandle {
                _guard: Some(guard),
                log_file_path: Some(dir.join(name)),
            })
        }
    }
}
