//! Supervision of long-running daemon services.
//!
//! The [`Supervisor`] keeps a registry of named tasks. Each task is an async
//! body that receives a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and is expected to return once that token is cancelled.
//!
//! ```text
//!            root scope
//!        ┌───────┴────────┐
//!   "server" scope   "relay" scope      ← one child per running task
//! ```
//!
//! A task moves `registered → running` on [`Supervisor::run`] or
//! [`Supervisor::run_all`], back to `registered` after a successful
//! [`Supervisor::shutdown`] / [`Supervisor::shutdown_all`], and out of the
//! registry after a successful [`Supervisor::remove_task`]. A timed-out
//! shutdown leaves the task marked running so the caller can retry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use termgate::supervisor::Supervisor;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), termgate::supervisor::SupervisorError> {
//! let supervisor = Supervisor::new()
//!     .with_failure_handler(|failure| tracing::error!("{}", failure));
//!
//! supervisor
//!     .add_task("heartbeat", |token: CancellationToken| async move {
//!         token.cancelled().await;
//!     })
//!     .await?;
//!
//! supervisor.run_all().await;
//! supervisor.shutdown_all(Some(Duration::from_secs(10))).await?;
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod task;
pub mod wait_group;

pub use manager::{Supervisor, SupervisorError};
pub use task::{FailureHandler, TaskFailure, TaskFn};
pub use wait_group::{WaitGroup, WaitGroupGuard};
