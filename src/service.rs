//! The logging service: acceptor, task wiring and teardown.
//!
//! Startup is split in two. [`ServiceBuilder::bind`] is synchronous and
//! claims the listening socket and the log store, so it can run before the
//! process detaches and before any async runtime exists. [`Service::run`]
//! then drives everything inside the runtime until shutdown:
//!
//! 1. accept connections, one registered handler task per connection,
//!    reaping finished handlers after each accept;
//! 2. append a timestamp record every period;
//! 3. on shutdown, stop accepting, join the timestamp task, join every
//!    handler, then close and delete the log. A second signal while
//!    handlers drain aborts the ones still open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::process::PidFileGuard;
use crate::registry::TaskRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownReason};
use crate::signal::SignalHandler;
use crate::store::LogStore;
use crate::timestamp::TimestampWriter;

/// Pause after a failed `accept` so a persistent failure (such as running
/// out of file descriptors) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Point-in-time counters of a running service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Connections accepted since start
    pub accepted: u64,
    /// Handlers registered and not yet reaped
    pub active_connections: usize,
    /// Handlers joined so far
    pub reaped: u64,
    /// Timestamp records appended
    pub timestamps_written: u64,
}

/// Cloneable view of a service's counters and shutdown flag.
#[derive(Debug, Clone)]
pub struct ServiceMonitor {
    registry: Arc<TaskRegistry>,
    accepted: Arc<AtomicU64>,
    timestamps_written: Arc<AtomicU64>,
    shutdown: ShutdownHandle,
}

impl ServiceMonitor {
    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let registry = self.registry.stats();
        ServiceStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active_connections: registry.active,
            reaped: registry.reaped,
            timestamps_written: self.timestamps_written.load(Ordering::Relaxed),
        }
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }
}

/// Builder for a [`Service`].
#[derive(Debug)]
pub struct ServiceBuilder {
    config: Config,
    enable_signals: bool,
}

impl ServiceBuilder {
    /// Create a builder for `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            enable_signals: true,
        }
    }

    /// Disable signal handling; shutdown must then be requested through
    /// [`Service::shutdown_coordinator`].
    #[must_use]
    pub const fn without_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Validate the configuration, bind the listening socket and open the
    /// log store.
    ///
    /// Does not require a running tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an invalid configuration, a `Transport`
    /// error with code `TransportBind` if the address cannot be bound, or the
    /// store's error if the log cannot be created or is locked by another
    /// instance.
    pub fn bind(self) -> Result<Service> {
        self.config.validate()?;

        let addr = self.config.listen_addr();
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr().map_err(|e| {
            Error::transport(
                ErrorCode::TransportBind,
                "Failed to read bound address",
                None,
                e,
            )
        })?;

        let store = LogStore::create(&self.config.storage.data_file, self.config.storage.sync_writes)?;

        info!(
            service = %self.config.name,
            %local_addr,
            data_file = %store.path().display(),
            "Listening"
        );

        Ok(Service {
            config: Arc::new(self.config),
            listener: Some(listener),
            local_addr,
            store: Arc::new(store),
            shutdown_coordinator: ShutdownCoordinator::new(),
            registry: Arc::new(TaskRegistry::new()),
            accepted: Arc::new(AtomicU64::new(0)),
            timestamps_written: Arc::new(AtomicU64::new(0)),
            enable_signals: self.enable_signals,
        })
    }
}

/// Bind `addr` as a non-blocking listener. The standard library sets
/// `SO_REUSEADDR` on Unix, so a restart does not wait out `TIME_WAIT`.
fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let bind_error = |e| {
        Error::transport(
            ErrorCode::TransportBind,
            format!("Failed to bind {addr}"),
            None,
            e,
        )
    };

    let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

/// A bound, not yet running, logging service.
#[derive(Debug)]
pub struct Service {
    config: Arc<Config>,
    /// Taken by `run`
    listener: Option<std::net::TcpListener>,
    local_addr: SocketAddr,
    store: Arc<LogStore>,
    shutdown_coordinator: ShutdownCoordinator,
    registry: Arc<TaskRegistry>,
    accepted: Arc<AtomicU64>,
    timestamps_written: Arc<AtomicU64>,
    enable_signals: bool,
}

impl Service {
    /// Create a builder for `config`.
    #[must_use]
    pub const fn builder(config: Config) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Absolute path of the log file.
    #[must_use]
    pub fn data_file(&self) -> &std::path::Path {
        self.store.path()
    }

    /// Coordinator that stops the service when shutdown is initiated.
    #[must_use]
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.shutdown_coordinator.clone()
    }

    /// Handle onto the service's counters, usable while it runs.
    #[must_use]
    pub fn monitor(&self) -> ServiceMonitor {
        ServiceMonitor {
            registry: Arc::clone(&self.registry),
            accepted: Arc::clone(&self.accepted),
            timestamps_written: Arc::clone(&self.timestamps_written),
            shutdown: self.shutdown_coordinator.handle(),
        }
    }

    /// Run until shutdown and tear everything down.
    ///
    /// Must be called from within a tokio runtime. On return
    /// every handler has finished, no timestamp is pending, the listener is
    /// closed and the log file has been deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if startup inside the runtime fails (PID file,
    /// listener registration, signal handlers) or if the log file cannot be
    /// removed during teardown. Connection failures are never returned.
    #[instrument(skip(self), fields(service = %self.config.name))]
    pub async fn run(mut self) -> Result<ServiceStats> {
        let started_at = Instant::now();
        let monitor = self.monitor();

        let (listener, signal_handler, pid_guard) = match self.start() {
            Ok(started) => started,
            Err(e) => {
                error!(error = %e, code = %e.code(), "Failed to start service");
                let _ = self.shutdown_coordinator.initiate_shutdown(ShutdownReason::Error);
                if let Err(discard_err) = self.store.discard().await {
                    warn!(error = %discard_err, "Failed to remove log store");
                }
                return Err(e);
            }
        };

        let shutdown = self.shutdown_coordinator.handle();
        let signal_task = signal_handler.map(|handler| tokio::spawn(handler.run()));
        let timestamp_task = self.config.timestamp.enabled.then(|| {
            let writer = TimestampWriter::new(
                Arc::clone(&self.store),
                self.config.timestamp_interval(),
                shutdown.clone(),
                Arc::clone(&self.timestamps_written),
            );
            tokio::spawn(writer.run())
        });

        info!("Service started, accepting connections");
        self.accept_loop(&listener, &shutdown).await;

        info!("Shutdown initiated, beginning graceful shutdown");
        drop(listener);

        if let Some(task) = timestamp_task {
            let outcome = task.await.map_err(|e| {
                Error::runtime_with_source(ErrorCode::RuntimeJoin, "Timestamp writer task failed", e)
            });
            if let Err(err) = outcome.and_then(|stopped| stopped) {
                warn!(error = %err, code = %err.code(), "Timestamp writer did not stop cleanly");
            }
        }

        let reaped = self
            .registry
            .drain(self.config.drain_timeout(), shutdown.forced())
            .await;
        debug!(reaped, forced = shutdown.is_forced(), "All connection tasks joined");

        // Nothing is left for a further signal to abort.
        if let Some(task) = signal_task {
            task.abort();
            match task.await {
                Err(e) if !e.is_cancelled() => {
                    let err = Error::runtime_with_source(ErrorCode::RuntimeJoin, "Signal handler task failed", e);
                    warn!(error = %err, code = %err.code(), "Signal handler did not stop cleanly");
                }
                _ => {}
            }
        }

        let discarded = self.store.discard().await;
        drop(pid_guard);

        let stats = monitor.stats();
        info!(
            uptime = ?started_at.elapsed(),
            shutdown_took = ?shutdown.elapsed(),
            accepted = stats.accepted,
            timestamps = stats.timestamps_written,
            "Service shutdown complete"
        );

        discarded.map(|()| stats)
    }

    /// Steps of startup that need the runtime.
    fn start(&mut self) -> Result<(TcpListener, Option<SignalHandler>, Option<PidFileGuard>)> {
        let pid_guard = self
            .config
            .pid_file
            .as_deref()
            .map(PidFileGuard::create)
            .transpose()?;

        let std_listener = self
            .listener
            .take()
            .ok_or_else(|| Error::invalid_state("Service listener already taken"))?;
        let listener = TcpListener::from_std(std_listener).map_err(|e| {
            Error::transport(
                ErrorCode::TransportBind,
                "Failed to register listener with the runtime",
                None,
                e,
            )
        })?;

        let signal_handler = if self.enable_signals {
            Some(SignalHandler::register(self.shutdown_coordinator.clone())?)
        } else {
            None
        };

        Ok((listener, signal_handler, pid_guard))
    }

    async fn accept_loop(&self, listener: &TcpListener, shutdown: &ShutdownHandle) {
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.dispatch(stream, peer);
                        let reaped = self.registry.reap().await;
                        if reaped > 0 {
                            debug!(reaped, active = self.registry.len(), "Reaped finished connections");
                        }
                    }
                    Err(e) => {
                        let err = Error::transport(
                            ErrorCode::TransportAccept,
                            "Failed to accept connection",
                            None,
                            e,
                        );
                        warn!(error = %err, code = %err.code(), "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "Accepted connection from {}", peer.ip());
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let store = Arc::clone(&self.store);
        let initial_capacity = self.config.connection.initial_buffer_size;
        self.registry.spawn(peer.to_string(), async move {
            let connection = Connection::new(stream, peer, initial_capacity).map_err(|e| {
                warn!(%peer, error = %e, code = %e.code(), "Connection failed");
                e
            })?;
            connection.serve(&store).await
        });
    }
}
