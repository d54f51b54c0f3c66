//! Shutdown flag shared by every component of the service.
//!
//! A [`ShutdownCoordinator`] owns the flag; [`ShutdownHandle`]s are cheap
//! clones handed to the acceptor and the timestamp task. Handles observe the
//! flag either by polling [`ShutdownHandle::is_shutdown`] or by awaiting
//! [`ShutdownHandle::cancelled`], which resolves as soon as shutdown starts.
//! Cancellation is cooperative: nothing is interrupted mid-operation, each
//! task decides where it checks the flag.
//!
//! A shutdown already in progress can be escalated with
//! [`ShutdownCoordinator::force_shutdown`]. Waiters on
//! [`ShutdownHandle::forced`] then stop waiting for connections to finish
//! on their own.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reason for shutdown initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Shutdown requested via signal (SIGTERM, SIGINT)
    Signal(i32),
    /// Shutdown requested programmatically
    Requested,
    /// Shutdown because the service failed to start
    Error,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(sig) => write!(f, "Signal({sig})"),
            Self::Requested => write!(f, "Requested"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Internal shutdown state shared between coordinator and handles.
#[derive(Debug)]
struct ShutdownInner {
    /// Flag indicating shutdown has been initiated
    shutdown_initiated: AtomicBool,
    /// Reason for shutdown
    shutdown_reason: ArcSwap<ShutdownReason>,
    /// Time when shutdown was initiated
    shutdown_time: Mutex<Option<Instant>>,
    /// Wakes every `cancelled()` waiter
    notify_tx: watch::Sender<bool>,
    /// Wakes every `forced()` waiter
    force_tx: watch::Sender<bool>,
}

impl ShutdownInner {
    fn new() -> Self {
        let (notify_tx, _) = watch::channel(false);
        let (force_tx, _) = watch::channel(false);
        Self {
            shutdown_initiated: AtomicBool::new(false),
            shutdown_reason: ArcSwap::new(Arc::new(ShutdownReason::Requested)),
            shutdown_time: Mutex::new(None),
            notify_tx,
            force_tx,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Returns true if this call initiated shutdown, false if shutdown was already in progress.
    fn initiate_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shutdown_reason.store(Arc::new(reason));
            *self.shutdown_time.lock() = Some(Instant::now());
            self.notify_tx.send_replace(true);

            info!(%reason, "Shutdown initiated");
            true
        } else {
            debug!("Shutdown already initiated, ignoring additional request");
            false
        }
    }

    /// Returns true if this call escalated the shutdown.
    fn force_shutdown(&self, reason: ShutdownReason) -> bool {
        let _ = self.initiate_shutdown(reason);
        let escalated = self.force_tx.send_if_modified(|forced| !std::mem::replace(forced, true));
        if escalated {
            warn!(%reason, "Forced shutdown requested");
        }
        escalated
    }
}

/// Handle for tasks to monitor the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl ShutdownHandle {
    /// Check if shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Wait for shutdown to be initiated.
    ///
    /// Resolves immediately if shutdown already started. Intended to be
    /// raced against a task's own suspension point with `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.notify_tx.subscribe();
        // The sender lives in `inner`, which this handle keeps alive, so
        // `wait_for` can only return once the flag flips.
        let _ = rx.wait_for(|initiated| *initiated).await;
    }

    /// Wait for the shutdown to be forced.
    pub async fn forced(&self) {
        let mut rx = self.inner.force_tx.subscribe();
        let _ = rx.wait_for(|forced| *forced).await;
    }

    /// Check if the shutdown has been forced.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        *self.inner.force_tx.borrow()
    }

    /// Get the reason for shutdown (if initiated).
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.is_shutdown()
            .then(|| **self.inner.shutdown_reason.load())
    }

    /// Time elapsed since shutdown was initiated.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner.shutdown_time.lock().map(|t| t.elapsed())
    }
}

/// Owner of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a new coordinator with the flag cleared.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner::new()),
        }
    }

    /// Create a handle observing this coordinator's flag.
    #[must_use]
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Set the shutdown flag.
    ///
    /// Returns true if this call initiated shutdown; later calls are ignored
    /// and keep the first reason.
    pub fn initiate_shutdown(&self, reason: ShutdownReason) -> bool {
        self.inner.initiate_shutdown(reason)
    }

    /// Escalate the shutdown: connections still open are aborted instead
    /// of awaited. Initiates shutdown with `reason` first if needed.
    ///
    /// Returns true if this call escalated the shutdown.
    pub fn force_shutdown(&self, reason: ShutdownReason) -> bool {
        self.inner.force_shutdown(reason)
    }

    /// Check if shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Get the reason for shutdown (if initiated).
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.handle().shutdown_reason()
    }
}
