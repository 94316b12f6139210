//! Named background tasks with one shutdown signal.
//!
//! A membership node runs a handful of long-lived loops: the replica poller,
//! the self-consistency monitor and the introspection server. They are
//! registered here under a name so that shutdown, status reporting and
//! fencing all go through one place.
//!
//! Tasks either receive the shutdown signal themselves (see
//! [`BackgroundTaskRegistry::subscribe`] and [`BackgroundTaskRegistry::adopt`])
//! or are wrapped by [`BackgroundTaskRegistry::spawn`], which drops the future
//! when shutdown fires.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// The task returned, panicked or was aborted.
    Finished,
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: Instant,
}

/// Registry of the node's background tasks.
pub struct BackgroundTaskRegistry {
    tasks: BTreeMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            tasks: BTreeMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Receiver that fires once on shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Sender half, for components that may request shutdown themselves
    /// (the fencing handler does).
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Spawn `task`, dropping it when shutdown fires.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "Task completed"),
                _ = shutdown_rx.recv() => debug!(task = name, "Task received shutdown signal"),
            }
        });
        self.insert(name, handle);
    }

    /// Track a task that was spawned elsewhere and watches the shutdown
    /// signal on its own.
    pub fn adopt(&mut self, name: &'static str, handle: JoinHandle<()>) {
        if self.shutting_down {
            warn!(task = name, "Aborting task adopted during shutdown");
            handle.abort();
            return;
        }
        self.insert(name, handle);
    }

    fn insert(&mut self, name: &'static str, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: Instant::now(),
            },
        ) {
            old.handle.abort();
            debug!(task = name, "Aborted previous task instance");
        }
        info!(task = name, "Background task registered");
    }

    /// Status of every task, by name.
    pub fn status(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Signal shutdown and wait up to `timeout` for every task. Tasks still
    /// running at the deadline are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(task_count = self.tasks.len(), "Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut info) in std::mem::take(&mut self.tasks) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let uptime_ms = info.spawned_at.elapsed().as_millis() as u64;
            match tokio::time::timeout(remaining, &mut info.handle).await {
                Ok(Ok(())) => debug!(task = name, uptime_ms, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => debug!(task = name, uptime_ms, "Task was aborted"),
                Ok(Err(e)) => warn!(task = name, uptime_ms, error = %e, "Task panicked"),
                Err(_) => {
                    info.handle.abort();
                    warn!(task = name, uptime_ms, "Task did not stop in time, aborted");
                }
            }
        }
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (name, info) in std::mem::take(&mut self.tasks) {
                debug!(task = name, "Aborting task on registry drop");
                info.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn test_spawn_and_status() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("forever", std::future::pending());
        registry.spawn("done", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert!(status.contains(&("forever", TaskStatus::Running)));
        assert!(status.contains(&("done", TaskStatus::Finished)));
        assert_eq!(registry.running_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_spawned_and_adopted() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("pending", std::future::pending());

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let mut rx = registry.subscribe();
        registry.adopt(
            "adopted",
            tokio::spawn(async move {
                let _ = rx.recv().await;
                flag.store(true, Ordering::SeqCst);
            }),
        );

        registry.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(registry.task_count(), 0);
        assert!(registry.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_unresponsive_task() {
        let mut registry = BackgroundTaskRegistry::new();
        let held = Arc::new(());
        let inside = held.clone();
        registry.adopt(
            "stubborn",
            tokio::spawn(async move {
                let _inside = inside;
                std::future::pending::<()>().await;
            }),
        );
        let started = Instant::now();
        registry.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[tokio::test]
    async fn test_same_name_replaces_task() {
        let mut registry = BackgroundTaskRegistry::new();
        let runs = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let runs = runs.clone();
            registry.spawn("poller", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.task_count(), 1);
        assert_eq!(registry.running_count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.shutdown(Duration::from_millis(10)).await;
        registry.spawn("late", async {});
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_sender_reaches_subscribers() {
        let registry = BackgroundTaskRegistry::new();
        let mut rx = registry.subscribe();
        registry.shutdown_sender().send(()).unwrap();
        assert!(rx.recv().await.is_ok());
    }
}
