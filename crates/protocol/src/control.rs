//! Control envelopes carried in text frames.
//!
//! Clients send a JSON object of the form
//! `{"type": "resize", "cols": 100, "rows": 40}` whenever the terminal
//! viewport changes. Anything that parses but is not a usable resize request
//! maps to [`ControlAction::Ignore`]; only input that is not JSON at all is
//! reported as an error.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The `type` value of a resize request.
pub const RESIZE_TYPE: &str = "resize";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl WindowSize {
    /// Creates a new window size.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// A control envelope as it appears on the wire.
///
/// Missing fields default to an empty type and zero dimensions, and unknown
/// fields are ignored, so older and newer clients can talk to the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlMessage {
    /// Message kind. Only [`RESIZE_TYPE`] is recognised.
    #[serde(rename = "type")]
    pub kind: String,
    /// Requested width.
    pub cols: i64,
    /// Requested height.
    pub rows: i64,
}

/// What the receiver should do with a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Apply the new window size to the terminal.
    Resize(WindowSize),
    /// Nothing to do.
    Ignore,
}

impl ControlMessage {
    /// Builds a resize request.
    pub fn resize(size: WindowSize) -> Self {
        Self {
            kind: RESIZE_TYPE.to_string(),
            cols: i64::from(size.cols),
            rows: i64::from(size.rows),
        }
    }

    /// Parses a text frame payload.
    ///
    /// Valid JSON that is not an object is accepted and yields a message
    /// whose action is [`ControlAction::Ignore`].
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interprets the message.
    ///
    /// A resize is only produced when both dimensions are strictly positive
    /// and fit in a terminal dimension (`u16`).
    pub fn action(&self) -> ControlAction {
        if self.kind != RESIZE_TYPE {
            return ControlAction::Ignore;
        }
        match (u16::try_from(self.cols), u16::try_from(self.rows)) {
            (Ok(cols), Ok(rows)) if cols > 0 && rows > 0 => {
                ControlAction::Resize(WindowSize::new(cols, rows))
            }
            _ => ControlAction::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_parse_resize() {
        let msg = ControlMessage::parse(r#"{"type":"resize","cols":100,"rows":40}"#).unwrap();
        assert_eq!(msg.kind, "resize");
        assert_eq!(msg.action(), ControlAction::Resize(WindowSize::new(100, 40)));
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let msg =
            ControlMessage::parse(r#"{"type":"resize","cols":80,"rows":24,"px":1}"#).unwrap();
        assert_eq!(msg.action(), ControlAction::Resize(WindowSize::new(80, 24)));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let msg = ControlMessage::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.action(), ControlAction::Ignore);
    }

    #[test]
    fn test_zero_or_negative_dimensions_are_ignored() {
        for payload in [
            r#"{"type":"resize","cols":0,"rows":40}"#,
            r#"{"type":"resize","cols":100,"rows":0}"#,
            r#"{"type":"resize","cols":-1,"rows":40}"#,
            r#"{"type":"resize"}"#,
        ] {
            let msg = ControlMessage::parse(payload).unwrap();
            assert_eq!(msg.action(), ControlAction::Ignore, "payload: {}", payload);
        }
    }

    #[test]
    fn test_oversized_dimensions_are_ignored() {
        let msg = ControlMessage::parse(r#"{"type":"resize","cols":70000,"rows":40}"#).unwrap();
        assert_eq!(msg.action(), ControlAction::Ignore);
    }

    #[test]
    fn test_non_object_json_is_ignored() {
        for payload in ["[1,2,3]", "\"resize\"", "42", "null"] {
            let msg = ControlMessage::parse(payload).unwrap();
            assert_eq!(msg.action(), ControlAction::Ignore);
        }
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let result = ControlMessage::parse("{\"type\":\"resize\",");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_wrong_field_type_is_an_error() {
        let result = ControlMessage::parse(r#"{"type":"resize","cols":"wide","rows":40}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_resize_builder_serializes_type_field() {
        let json = ControlMessage::resize(WindowSize::new(120, 30))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""type":"resize""#));
        assert!(json.contains(r#""cols":120"#));
        assert!(json.contains(r#""rows":30"#));
    }

    #[test]
    fn test_default_window_size() {
        assert_eq!(WindowSize::default(), WindowSize::new(80, 24));
    }
}
