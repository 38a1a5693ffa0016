//! Interactive terminal sessions over WebSocket.
//!
//! - [`pty`]: spawning shells on pseudo-terminals
//! - [`bridge`]: one connection ⇄ one pty
//! - [`server`]: accept loop feeding the bridge

pub mod bridge;
pub mod pty;
pub mod server;

pub use bridge::{
    BridgeConfig, FrameConnection, SessionSummary, TerminalBridge, READ_CHUNK_SIZE,
    SPAWN_FAILURE_NOTICE, WRITE_DEADLINE,
};
pub use pty::{
    ExitInfo, NativePtySpawner, PtyChild, PtyMaster, PtySpawner, ShellCommand, SpawnedPty,
    TerminalError,
};
pub use server::TerminalServer;
