//! Structured logging setup.
//!
//! Human-readable compact output by default, JSON with the `json-logs`
//! feature. `RUST_LOG` directives are honored on top of the configured level.
//! When a log file is configured, records are appended to it instead of
//! stdout, which is the only useful destination once the process has
//! detached from its terminal.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Shared append-only log file handed out to the fmt layer.
#[derive(Clone)]
struct FileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileWriter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

struct FileWriterGuard {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::writer::MakeWriter<'a> for FileWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn make_writer(config: &LogConfig) -> Result<BoxMakeWriter> {
    match &config.file {
        Some(path) => {
            let writer = FileWriter::open(path).map_err(|e| {
                Error::io_with_source(
                    format!("Failed to initialize log file at {}", path.display()),
                    e,
                )
            })?;
            Ok(BoxMakeWriter::new(writer))
        }
        None => Ok(BoxMakeWriter::new(io::stdout)),
    }
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns a `Config` error if a subscriber is already installed, if JSON
/// output is requested without the `json-logs` feature, or an `Io` error if
/// the log file cannot be opened.
pub fn init(config: &LogConfig) -> Result<()> {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let writer = make_writer(config)?;

    if config.is_json() {
        #[cfg(feature = "json-logs")]
        {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::NONE)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(writer)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .finish();

            tracing::subscriber::set_global_default(subscriber).map_err(|e| {
                Error::config(format!("Failed to initialize JSON logging: {e}"))
            })?;

            debug!(level = ?config.level, "JSON logging initialized");
            return Ok(());
        }

        #[cfg(not(feature = "json-logs"))]
        {
            return Err(Error::config(
                "JSON logging requested but feature not enabled",
            ));
        }
    }

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NONE)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(writer)
        .with_ansi(config.is_colored())
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::config(format!("Failed to initialize logging: {e}")))?;

    debug!(level = ?config.level, "Logging initialized");
    Ok(())
}
