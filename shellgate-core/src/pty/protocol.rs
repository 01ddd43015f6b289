//! Tagged control envelope exchanged with an attached transport.
//!
//! Inbound frames are `{"type": "input" | "resize" | "ping", ...}`. Anything
//! that does not parse as one of those is raw keyboard input.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input {
        data: String,
    },
    Resize {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Ping,
}

impl ClientMessage {
    /// Parse one inbound text frame, falling back to raw input.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(_) => ClientMessage::Input {
                data: text.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Output {
        data: String,
    },
    Exit {
        code: Option<i32>,
    },
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
