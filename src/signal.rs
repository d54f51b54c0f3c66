//! Termination signal handling.
//!
//! SIGINT and SIGTERM request a graceful shutdown through the
//! [`ShutdownCoordinator`]. The handler keeps listening while connections
//! drain: a further signal forces the shutdown, aborting connections that
//! are still open. Handlers are registered eagerly by
//! [`SignalHandler::register`] so that a registration failure surfaces during
//! startup rather than after the service is already accepting connections.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// Signal number of SIGINT.
pub const SIGINT: i32 = 2;
/// Signal number of SIGTERM.
pub const SIGTERM: i32 = 15;

/// Helper function to get a human-readable description of a signal.
#[must_use]
pub const fn signal_description(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT (Interrupt/Ctrl+C)",
        SIGTERM => "SIGTERM (Terminate)",
        _ => "Unknown signal",
    }
}

#[cfg(unix)]
struct Streams {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Streams {
    fn register() -> Result<Self> {
        use crate::error::Error;
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate()).map_err(|e| {
            Error::signal_with_source("Failed to register SIGTERM handler", SIGTERM, e)
        })?;
        let sigint = signal(SignalKind::interrupt()).map_err(|e| {
            Error::signal_with_source("Failed to register SIGINT handler", SIGINT, e)
        })?;

        info!("Unix signal handlers registered (SIGTERM, SIGINT)");
        Ok(Self { sigterm, sigint })
    }

    async fn next(&mut self) -> i32 {
        tokio::select! {
            _ = self.sigterm.recv() => SIGTERM,
            _ = self.sigint.recv() => SIGINT,
        }
    }
}

#[cfg(not(unix))]
struct Streams;

#[cfg(not(unix))]
impl Streams {
    #[allow(clippy::unnecessary_wraps)]
    fn register() -> Result<Self> {
        info!("Ctrl+C handler registered");
        Ok(Self)
    }

    async fn next(&mut self) -> i32 {
        // A failed registration leaves the future pending; shutdown can then
        // only be requested programmatically.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        SIGINT
    }
}

/// Translates termination signals into a shutdown request.
pub struct SignalHandler {
    shutdown_coordinator: ShutdownCoordinator,
    streams: Streams,
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("shutdown_coordinator", &self.shutdown_coordinator)
            .finish_non_exhaustive()
    }
}

impl SignalHandler {
    /// Register SIGINT and SIGTERM handlers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a `Signal` error if a handler cannot be registered.
    pub fn register(shutdown_coordinator: ShutdownCoordinator) -> Result<Self> {
        Ok(Self {
            shutdown_coordinator,
            streams: Streams::register()?,
        })
    }

    /// Wait for a termination signal and initiate shutdown, then wait for
    /// another one and force it.
    ///
    /// Returns once shutdown has been forced, whether by a signal or by any
    /// other caller of the coordinator. The service aborts the task once
    /// every connection has been joined.
    pub async fn run(mut self) {
        let shutdown = self.shutdown_coordinator.handle();

        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Shutdown initiated elsewhere");
            }
            signal = self.streams.next() => {
                info!(signal, description = signal_description(signal), "Caught signal, exiting");
                let _ = self
                    .shutdown_coordinator
                    .initiate_shutdown(ShutdownReason::Signal(signal));
            }
        }

        tokio::select! {
            () = shutdown.forced() => {
                debug!("Shutdown forced elsewhere, signal handler exiting");
            }
            signal = self.streams.next() => {
                warn!(
                    signal,
                    description = signal_description(signal),
                    "Caught signal during shutdown, aborting open connections"
                );
                let _ = self
                    .shutdown_coordinator
                    .force_shutdown(ShutdownReason::Signal(signal));
            }
        }
    }
}
