//! Named task registry with hierarchical cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::task::{boxed_task, FailureHandler, TaskFailure, TaskUnit};
use super::wait_group::WaitGroup;

/// Errors returned by supervisor operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// No task is registered under this name.
    #[error("task does not exist: {0}")]
    NotFound(String),

    /// The task did not finish within the allotted time.
    ///
    /// The task keeps its running flag (and its registration); the call can
    /// be retried.
    #[error("timed out after {timeout:?} waiting for {name} to stop")]
    Timeout {
        /// Task name, or `"*"` for [`Supervisor::shutdown_all`].
        name: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Replacing the descriptor of a running task would orphan it.
    #[error("task is running and cannot be replaced: {0}")]
    AlreadyRunning(String),
}

/// Supervisor for named, long-running tasks.
///
/// Every task runs under a child of the supervisor's root
/// [`CancellationToken`] and inside a failure boundary: a panicking body is
/// reported to the failure handler and never reaches sibling tasks or the
/// caller. All registry operations are serialized by a single lock, which
/// is held for the whole duration of shutdown waits.
pub struct Supervisor {
    tasks: Mutex<HashMap<String, TaskUnit>>,
    root: CancellationToken,
    in_flight: WaitGroup,
    on_failure: FailureHandler,
}

impl Supervisor {
    /// Creates a supervisor with its own root scope and the default failure
    /// handler, which writes the failure to stderr.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            in_flight: WaitGroup::new(),
            on_failure: Arc::new(default_failure_handler),
        }
    }

    /// Sets the callback that receives task panics.
    pub fn with_failure_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(TaskFailure) + Send + Sync + 'static,
    {
        self.on_failure = Arc::new(handler);
        self
    }

    /// Nests the root scope under `parent`, so cancelling `parent` cancels
    /// every task.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.root = parent.child_token();
        self
    }

    /// Returns a handle to the root scope.
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Registers `work` under `name`, replacing an existing idle descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] if a task with this name
    /// is currently running.
    pub async fn add_task<F, Fut>(&self, name: impl Into<String>, work: F) -> Result<(), SupervisorError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.lock().await;

        if tasks.get(&name).is_some_and(|unit| unit.running) {
            return Err(SupervisorError::AlreadyRunning(name));
        }

        tracing::debug!(task = %name, "Registered task");
        tasks.insert(name, TaskUnit::new(boxed_task(work)));
        Ok(())
    }

    /// Starts every registered task that is not already running.
    pub async fn run_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (name, unit) in tasks.iter_mut() {
            if !unit.running {
                self.launch(name, unit);
            }
        }
    }

    /// Starts a single task. Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotFound`] if `name` is not registered.
    pub async fn run(&self, name: &str) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().await;
        let unit = tasks
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        if !unit.running {
            self.launch(name, unit);
        }
        Ok(())
    }

    /// Cancels a running task and waits for it to finish.
    ///
    /// `timeout` of `None` waits indefinitely. Unknown or idle tasks are a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Timeout`] if the task is still running
    /// when the timeout elapses; it stays marked as running.
    pub async fn shutdown(&self, name: &str, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().await;
        let Some(unit) = tasks.get_mut(name) else {
            return Ok(());
        };

        if unit.running {
            Self::stop_unit(name, unit, timeout).await?;
        }
        Ok(())
    }

    /// Cancels every task and waits for all of them to finish.
    ///
    /// All scopes are cancelled before any waiting starts, so the total
    /// duration is bounded by the slowest task rather than the sum.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Timeout`] if any task is still running
    /// when the timeout elapses; every running flag is left untouched.
    pub async fn shutdown_all(&self, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().await;

        for unit in tasks.values().filter(|unit| unit.running) {
            if let Some(token) = &unit.token {
                token.cancel();
            }
        }

        self.in_flight
            .wait_timeout(timeout)
            .await
            .map_err(|_| SupervisorError::Timeout {
                name: "*".to_string(),
                timeout: timeout.unwrap_or_default(),
            })?;

        for unit in tasks.values_mut() {
            unit.running = false;
        }
        tracing::debug!("All tasks stopped");
        Ok(())
    }

    /// Stops a task if needed, then unregisters it.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Timeout`] if the task did not stop in
    /// time. The registration is kept so the call can be retried.
    pub async fn remove_task(&self, name: &str, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().await;
        let Some(unit) = tasks.get_mut(name) else {
            return Ok(());
        };

        if unit.running {
            Self::stop_unit(name, unit, timeout).await?;
        }

        tasks.remove(name);
        tracing::debug!(task = %name, "Removed task");
        Ok(())
    }

    /// Returns whether `name` is marked running, or `None` if unregistered.
    pub async fn is_running(&self, name: &str) -> Option<bool> {
        self.tasks.lock().await.get(name).map(|unit| unit.running)
    }

    /// Returns the registered task names, sorted.
    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of task bodies currently executing.
    pub fn active_count(&self) -> usize {
        self.in_flight.count()
    }

    /// Spawns one run of `unit`. The caller holds the registry lock.
    fn launch(&self, name: &str, unit: &mut TaskUnit) {
        let token = self.root.child_token();
        unit.token = Some(token.clone());
        unit.running = true;

        let task_guard = unit.in_flight.enter();
        let all_guard = self.in_flight.enter();
        let work = Arc::clone(&unit.work);
        let on_failure = Arc::clone(&self.on_failure);
        let task_name = name.to_string();

        tracing::debug!(task = %name, "Starting task");

        tokio::spawn(async move {
            let _guards = (task_guard, all_guard);
            let body = AssertUnwindSafe(async move { work(token).await });
            if let Err(payload) = body.catch_unwind().await {
                on_failure(TaskFailure::from_panic(task_name, payload));
            }
        });
    }

    async fn stop_unit(name: &str, unit: &mut TaskUnit, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        if let Some(token) = &unit.token {
            token.cancel();
        }

        unit.in_flight
            .wait_timeout(timeout)
            .await
            .map_err(|_| SupervisorError::Timeout {
                name: name.to_string(),
                timeout: timeout.unwrap_or_default(),
            })?;

        unit.running = false;
        tracing::debug!(task = %name, "Task stopped");
        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn default_failure_handler(failure: TaskFailure) {
    eprintln!("panic occurred: {}", failure);
}
