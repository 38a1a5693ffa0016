//! # Termgate Protocol Library
//!
//! Wire definitions shared by everything that speaks the termgate terminal
//! channel.
//!
//! ## Overview
//!
//! A terminal channel is a WebSocket connection carrying two kinds of frames:
//!
//! - **Binary frames**: raw terminal bytes, forwarded verbatim in both
//!   directions. There is no framing beyond the WebSocket message boundary.
//! - **Text frames**: a JSON control envelope sent by the client, see
//!   [`ControlMessage`]. Only `resize` is acted on today.
//!
//! ```text
//! client                                   daemon
//!   │ ── Binary(keystrokes) ───────────────▶ │ ─▶ pty
//!   │ ── Text({"type":"resize",...}) ──────▶ │ ─▶ TIOCSWINSZ
//!   │ ◀─────────────── Binary(pty output) ── │ ◀─ pty
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ControlAction, ControlMessage, WindowSize};
//!
//! let msg = ControlMessage::parse(r#"{"type":"resize","cols":100,"rows":40}"#).unwrap();
//! assert_eq!(msg.action(), ControlAction::Resize(WindowSize::new(100, 40)));
//! ```

pub mod control;
pub mod error;

pub use control::{ControlAction, ControlMessage, WindowSize, RESIZE_TYPE};
pub use error::{ProtocolError, Result};
