//! Periodic timestamp records.
//!
//! While the service runs, a [`TimestampWriter`] appends one line of the form
//!
//! ```text
//! timestamp:Mon, 19 Oct 2026 14:03:07 +0200
//! ```
//!
//! to the log every period. The first record is written one full period
//! after start. Shutdown is observed while waiting for the next tick, so the
//! task stops within one tick of the flag being set and never writes a
//! record after shutdown has been observed.

use chrono::{DateTime, Local, TimeZone};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::shutdown::ShutdownHandle;
use crate::store::LogStore;

/// Prefix of every timestamp record.
pub const TIMESTAMP_PREFIX: &str = "timestamp:";

/// RFC 2822 style layout used after the prefix.
pub const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Render one complete record, including the trailing newline.
pub fn format_entry<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{TIMESTAMP_PREFIX}{}\n", at.format(TIMESTAMP_FORMAT))
}

/// Record for the current local time.
#[must_use]
pub fn entry() -> String {
    format_entry(&Local::now())
}

/// Background task appending a timestamp record every period.
#[derive(Debug)]
pub struct TimestampWriter {
    store: Arc<LogStore>,
    period: Duration,
    shutdown: ShutdownHandle,
    written: Arc<AtomicU64>,
}

impl TimestampWriter {
    /// Create a writer for `store`.
    ///
    /// `written` is incremented once per record appended.
    #[must_use]
    pub fn new(
        store: Arc<LogStore>,
        period: Duration,
        shutdown: ShutdownHandle,
        written: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            period,
            shutdown,
            written,
        }
    }

    /// Run until shutdown is initiated.
    ///
    /// A failed append is logged and the task keeps going; the next tick
    /// tries again.
    ///
    /// # Errors
    ///
    /// Currently never fails; the `Result` matches the other service tasks.
    pub async fn run(self) -> Result<()> {
        info!(period_ms = self.period_ms(), "Timestamp writer started");

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!("Timestamp writer observed shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    if self.shutdown.is_shutdown() {
                        break;
                    }
                    self.write_once().await;
                }
            }
        }

        info!(
            written = self.written.load(Ordering::Relaxed),
            "Timestamp writer stopped"
        );
        Ok(())
    }

    async fn write_once(&self) {
        let record = entry();
        match self.store.append(record.as_bytes()).await {
            Ok(_) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                trace!(record = record.trim_end(), "Timestamp appended");
            }
            Err(e) => {
                warn!(error = %e, code = %e.code(), "Failed to append timestamp");
            }
        }
    }

    fn period_ms(&self) -> u64 {
        u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX)
    }
}
