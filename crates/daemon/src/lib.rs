//! # termgate
//!
//! A daemon that serves interactive shells to browsers over WebSocket.
//!
//! ## Overview
//!
//! Each WebSocket connection gets its own shell on a fresh pseudo-terminal.
//! Binary frames carry raw terminal bytes in both directions; text frames
//! carry JSON control messages such as
//! `{"type":"resize","cols":120,"rows":30}`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Daemon                           │
//! │   signals ─► Supervisor ──┬── "server" ─► TerminalServer │
//! │                           │                 │            │
//! │                           │          TerminalBridge × N  │
//! │                           │                 │            │
//! │                           └── "relay"  ◄── ShutdownRelay │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`supervisor`]: named long-running tasks with cancellation scopes
//! - [`relay`]: internal shutdown requests
//! - [`terminal`]: pty spawning, the session bridge and the listener
//! - [`config`]: configuration loading and defaults
//! - [`logging`]: tracing subscriber setup
//! - [`pidfile`]: single-instance detection
//! - [`daemon`]: process wiring

pub mod config;
pub mod daemon;
pub mod logging;
pub mod pidfile;
pub mod relay;
pub mod supervisor;
pub mod terminal;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use daemon::Daemon;
pub use relay::{RelayError, RelayEvent, ShutdownRelay};
pub use supervisor::{Supervisor, SupervisorError, TaskFailure};
pub use terminal::{BridgeConfig, SessionSummary, TerminalBridge, TerminalError, TerminalServer};
