//! Registry of in-flight connection tasks.
//!
//! Every spawned handler is recorded together with a completion flag. The
//! flag is set by a guard owned by the task itself, so it flips on normal
//! return, on error, on panic and on abort alike. The acceptor calls
//! [`TaskRegistry::reap`] after each accepted connection to join whatever has
//! finished, and the shutdown path calls [`TaskRegistry::reap_all`] to join
//! everything that is left.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Unique identifier for a registered task.
pub type TaskId = u64;

/// Metadata about a registered task.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    /// Unique identifier
    pub id: TaskId,
    /// Human-readable name, usually the peer address
    pub name: String,
    /// When the task was registered
    pub registered_at: Instant,
}

/// Statistics for registry monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Tasks currently recorded (running or finished but not yet reaped)
    pub active: usize,
    /// Tasks ever registered
    pub registered: u64,
    /// Tasks joined so far
    pub reaped: u64,
}

/// Sets the completion flag when the owning task's future is dropped.
struct CompletionGuard(Arc<AtomicBool>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

struct TaskEntry {
    metadata: TaskMetadata,
    done: Arc<AtomicBool>,
    task_handle: JoinHandle<Result<()>>,
}

impl TaskEntry {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Concurrent collection of connection tasks.
pub struct TaskRegistry {
    tasks: DashMap<TaskId, TaskEntry>,
    next_id: AtomicU64,
    total_registered: AtomicU64,
    total_reaped: AtomicU64,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("active", &self.tasks.len())
            .field("registered", &self.total_registered.load(Ordering::Relaxed))
            .field("reaped", &self.total_reaped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
            total_registered: AtomicU64::new(0),
            total_reaped: AtomicU64::new(0),
        }
    }

    /// Spawn `future` on the current runtime and record it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> TaskId
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done = Arc::new(AtomicBool::new(false));
        let guard = CompletionGuard(Arc::clone(&done));

        let task_handle = tokio::spawn(async move {
            let _guard = guard;
            future.await
        });

        let metadata = TaskMetadata {
            id,
            name: name.into(),
            registered_at: Instant::now(),
        };
        debug!(task_id = id, task_name = %metadata.name, "Registered task");

        self.tasks.insert(
            id,
            TaskEntry {
                metadata,
                done,
                task_handle,
            },
        );
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Join and remove every task whose completion flag is set.
    ///
    /// Tasks still running are left untouched. Returns the number of tasks
    /// reaped.
    pub async fn reap(&self) -> usize {
        let finished: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.is_done())
            .map(|entry| *entry.key())
            .collect();

        // No map guard may be held across the joins below.
        let entries: Vec<TaskEntry> = finished
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id).map(|(_, entry)| entry))
            .collect();

        let count = entries.len();
        for entry in entries {
            self.join(entry).await;
        }
        count
    }

    /// Join every recorded task, running or not, until the registry is empty.
    ///
    /// With `drain_timeout` set, tasks still running when it elapses are
    /// aborted and then joined. Without it, this waits as long as the tasks
    /// take. Returns the number of tasks reaped.
    pub async fn reap_all(&self, drain_timeout: Option<Duration>) -> usize {
        self.drain(drain_timeout, std::future::pending()).await
    }

    /// Like [`reap_all`](Self::reap_all), but also aborts the remaining
    /// tasks as soon as `force` resolves.
    pub async fn drain<F>(&self, drain_timeout: Option<Duration>, force: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let deadline = drain_timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        tokio::pin!(force);
        let mut aborting = false;
        let mut total = 0;

        while !self.tasks.is_empty() {
            let ids: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
            let entries: Vec<TaskEntry> = ids
                .into_iter()
                .filter_map(|id| self.tasks.remove(&id).map(|(_, entry)| entry))
                .collect();

            let pending = entries.iter().filter(|entry| !entry.is_done()).count();
            info!(
                tasks = entries.len(),
                pending, "Waiting for connection tasks to finish"
            );

            let abort_handles: Vec<_> = entries
                .iter()
                .map(|entry| entry.task_handle.abort_handle())
                .collect();
            total += entries.len();

            let joins = futures::future::join_all(entries.into_iter().map(|e| self.join(e)));
            tokio::pin!(joins);

            if !aborting {
                aborting = tokio::select! {
                    _ = &mut joins => false,
                    () = expired(deadline) => {
                        let timeout = drain_timeout.unwrap_or_default();
                        let err = Error::timeout(
                            "drain connection tasks",
                            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        );
                        warn!(error = %err, code = %err.code(), "Aborting remaining connection tasks");
                        true
                    }
                    () = &mut force => {
                        warn!("Shutdown forced, aborting remaining connection tasks");
                        true
                    }
                };
                if !aborting {
                    continue;
                }
            }

            for handle in &abort_handles {
                handle.abort();
            }
            joins.await;
        }

        total
    }

    /// Number of recorded tasks, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Metadata for every recorded task.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskMetadata> {
        self.tasks
            .iter()
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Get statistics about the registry.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.tasks.len(),
            registered: self.total_registered.load(Ordering::Relaxed),
            reaped: self.total_reaped.load(Ordering::Relaxed),
        }
    }

    async fn join(&self, entry: TaskEntry) {
        let TaskEntry {
            metadata,
            task_handle,
            ..
        } = entry;

        match task_handle.await {
            Ok(Ok(())) => {
                debug!(task_id = metadata.id, task_name = %metadata.name, "Task reaped");
            }
            Ok(Err(e)) => {
                // The task logged its own failure.
                debug!(task_id = metadata.id, task_name = %metadata.name, error = %e, "Task reaped after error");
            }
            Err(e) if e.is_cancelled() => {
                debug!(task_id = metadata.id, task_name = %metadata.name, "Task aborted");
            }
            Err(e) => {
                error!(task_id = metadata.id, task_name = %metadata.name, error = %e, "Task panicked");
            }
        }

        self.total_reaped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resolves at `deadline`, or never without one.
async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reap_only_finished_tasks() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let registry = TaskRegistry::new();
            let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

            registry.spawn("quick", async { Ok(()) });
            registry.spawn("failing", async { Err(Error::invalid_state("boom")) });
            registry.spawn("blocked", async move {
                let _ = release_rx.await;
                Ok(())
            });
            assert_eq!(registry.len(), 3);

            // Give the quick tasks a chance to run.
            while registry.tasks.iter().filter(|e| e.is_done()).count() < 2 {
                tokio::task::yield_now().await;
            }

            assert_eq!(registry.reap().await, 2);
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.tasks()[0].name, "blocked");

            let _ = release_tx.send(());
            assert_eq!(registry.reap_all(None).await, 1);
            assert!(registry.is_empty());

            let stats = registry.stats();
            assert_eq!(stats.registered, 3);
            assert_eq!(stats.reaped, 3);
            assert_eq!(stats.active, 0);
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_panicking_task_is_reaped() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let registry = TaskRegistry::new();
            let fail = true;
            registry.spawn("panics", async move {
                assert!(!fail, "handler failure");
                Ok(())
            });

            while registry.reap().await == 0 {
                tokio::task::yield_now().await;
            }
            assert!(registry.is_empty());
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_reap_all_aborts_after_drain_timeout() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let registry = TaskRegistry::new();
            registry.spawn("stuck", async {
                std::future::pending::<()>().await;
                Ok(())
            });

            let start = Instant::now();
            let reaped = registry.reap_all(Some(Duration::from_millis(50))).await;

            assert_eq!(reaped, 1);
            assert!(registry.is_empty());
            assert!(start.elapsed() >= Duration::from_millis(50));
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_drain_aborts_when_forced() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let registry = TaskRegistry::new();
            let (force_tx, force_rx) = tokio::sync::oneshot::channel::<()>();

            registry.spawn("finishes", async { Ok(()) });
            registry.spawn("stuck", async {
                std::future::pending::<()>().await;
                Ok(())
            });

            let forcer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = force_tx.send(());
            });

            let reaped = registry
                .drain(None, async {
                    let _ = force_rx.await;
                })
                .await;

            assert_eq!(reaped, 2);
            assert!(registry.is_empty());
            assert_eq!(registry.stats().reaped, 2);
            forcer.await.unwrap();
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
