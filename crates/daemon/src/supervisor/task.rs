//! Task descriptors and failure reports.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::wait_group::WaitGroup;

/// Type-erased task body.
///
/// The body is called once per run with that run's cancellation token and
/// must return when the token is cancelled.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback receiving task failures.
pub type FailureHandler = Arc<dyn Fn(TaskFailure) + Send + Sync>;

/// A task body that aborted by panicking.
///
/// Produced by the supervisor's failure boundary and handed to the
/// configured [`FailureHandler`]. It is never re-raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name of the task that panicked.
    pub task: String,
    /// Panic payload rendered as text.
    pub message: String,
}

impl TaskFailure {
    /// Builds a failure report from a panic payload.
    pub fn from_panic(task: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self {
            task: task.into(),
            message,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task '{}' panicked: {}", self.task, self.message)
    }
}

/// Wraps an async closure into a [`TaskFn`].
pub(crate) fn boxed_task<F, Fut>(work: F) -> TaskFn
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |token: CancellationToken| -> BoxFuture<'static, ()> { Box::pin(work(token)) })
}

/// Registry entry for one named task.
pub(crate) struct TaskUnit {
    /// The body to run.
    pub(crate) work: TaskFn,
    /// Set on launch, cleared only by a successful shutdown.
    pub(crate) running: bool,
    /// Cancellation scope of the current (or last) run.
    pub(crate) token: Option<CancellationToken>,
    /// Instances of this task still executing.
    pub(crate) in_flight: WaitGroup,
}

impl TaskUnit {
    pub(crate) fn new(work: TaskFn) -> Self {
        Self {
            work,
            running: false,
            token: None,
            in_flight: WaitGroup::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_from_str_payload() {
        let failure = TaskFailure::from_panic("worker", Box::new("exploded"));
        assert_eq!(failure.task, "worker");
        assert_eq!(failure.message, "exploded");
    }

    #[test]
    fn test_failure_from_string_payload() {
        let failure = TaskFailure::from_panic("worker", Box::new(String::from("index 3")));
        assert_eq!(failure.message, "index 3");
    }

    #[test]
    fn test_failure_from_opaque_payload() {
        let failure = TaskFailure::from_panic("worker", Box::new(42u32));
        assert_eq!(failure.message, "non-string panic payload");
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure {
            task: "server".to_string(),
            message: "bad state".to_string(),
        };
        assert_eq!(failure.to_string(), "task 'server' panicked: bad state");
    }

    #[test]
    fn test_new_unit_is_idle() {
        let unit = TaskUnit::new(boxed_task(|_token| async {}));
        assert!(!unit.running);
        assert!(unit.token.is_none());
        assert_eq!(unit.in_flight.count(), 0);
    }
}
