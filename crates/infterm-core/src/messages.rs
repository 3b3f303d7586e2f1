//! JSON text-frame messages exchanged on the `/terminal` WebSocket.
//!
//! Every frame is an object tagged by `type`. Field names follow the
//! browser client's camelCase convention (`sessionId`, `exitCode`).

use crate::error::BridgeResult;
use serde::{Deserialize, Serialize};

/// Messages sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Raw keystrokes, written to the PTY unfiltered.
    Input { data: String },
    /// Terminal geometry change.
    Resize { cols: u16, rows: u16 },
    /// A whole command line, checked by the command filter before it runs.
    Execute { command: String },
    /// Client is ready to render; triggers the scrollback replay.
    Ready,
    /// Explicit request to end the session now instead of detaching.
    Close,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once per connection after the session is bound.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        restored: bool,
        token: String,
    },
    /// Terminal output (live or replayed).
    Output { data: String },
    /// Connection-level error; fatal ones are followed by a close frame.
    Error { data: String },
    /// The shell is gone.
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        signal: i32,
    },
}

impl ServerMessage {
    pub fn error(data: impl Into<String>) -> Self {
        ServerMessage::Error { data: data.into() }
    }

    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Terminal notice shown in place of a blocked command.
    pub fn security_notice(reason: &str) -> Self {
        ServerMessage::Output {
            data: format!("\r\n\x1b[31m[SECURITY] Dangerous command blocked: {reason}\x1b[0m\r\n"),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_client_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"input","data":"ls\r"}"#).unwrap(),
            ClientMessage::Input { data: "ls\r".into() }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap(),
            ClientMessage::Resize { cols: 120, rows: 40 }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"execute","command":"git status"}"#).unwrap(),
            ClientMessage::Execute { command: "git status".into() }
        );
        assert_eq!(ClientMessage::parse(r#"{"type":"ready"}"#).unwrap(), ClientMessage::Ready);
        assert_eq!(ClientMessage::parse(r#"{"type":"close"}"#).unwrap(), ClientMessage::Close);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"resize","cols":"wide"}"#).is_err());
    }

    #[test]
    fn session_frame_uses_camel_case() {
        let msg = ServerMessage::Session {
            session_id: "ab".repeat(32),
            restored: true,
            token: "cd".repeat(32),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["sessionId"], "ab".repeat(32));
        assert_eq!(json["restored"], true);
    }

    #[test]
    fn exit_frame_shape() {
        let msg = ServerMessage::Exit { exit_code: 2, signal: 0 };
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"exit","exitCode":2,"signal":0}"#);
    }

    #[test]
    fn security_notice_mentions_reason() {
        let ServerMessage::Output { data } = ServerMessage::security_notice("fork bomb") else {
            panic!("expected output frame");
        };
        assert!(data.contains("[SECURITY]"));
        assert!(data.contains("Dangerous command blocked"));
        assert!(data.contains("fork bomb"));
    }
}
