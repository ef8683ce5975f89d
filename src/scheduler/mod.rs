use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Handle to a registered periodic task
pub type TaskId = u64;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

struct Registration {
    name: &'static str,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    runtime: Option<Handle>,
    tasks: Mutex<HashMap<TaskId, Registration>>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Binds to the ambient Tokio runtime, if there is one. Registering a
    /// task without a runtime fails.
    pub fn new() -> Self {
        Self::build(Handle::try_current().ok())
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self::build(Some(handle))
    }

    fn build(runtime: Option<Handle>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    fn runtime(&self) -> Result<&Handle> {
        self.runtime
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no Tokio runtime for background tasks".into()))
    }

    /// Register a periodic background task. The first run happens one
    /// interval after registration. A zero interval is rejected.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<TaskId> {
        if task.interval().is_zero() {
            return Err(Error::InvalidState(format!(
                "task {} has a zero interval",
                task.name()
            )));
        }
        let runtime = self.runtime()?.clone();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = task.name();
        let (cancel, cancelled) = oneshot::channel();
        let handle = self.spawn_timer_loop(&runtime, task, cancelled);
        self.tasks.lock().insert(
            id,
            Registration {
                name,
                cancel,
                handle,
            },
        );
        tracing::debug!(task = name, id, "Registered background task");
        Ok(id)
    }

    /// Stops a task's timer. A run already in progress finishes on its own.
    /// Returns false if `id` is not registered.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(registration) = self.tasks.lock().remove(&id) else {
            return false;
        };
        registration.cancel.send(()).ok();
        tracing::debug!(task = registration.name, id, "Cancelled background task");
        true
    }

    pub fn is_registered(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Spawn one-off task
    pub fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime()?.spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "One-off task failed");
            }
        });
        Ok(())
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(
        &self,
        runtime: &Handle,
        task: Arc<T>,
        mut cancelled: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = &mut cancelled => {
                        tracing::debug!(task = task.name(), "Task cancelled");
                        break;
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        let registrations: Vec<Registration> =
            self.tasks.lock().drain().map(|(_, r)| r).collect();
        for registration in registrations {
            registration
                .handle
                .await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
