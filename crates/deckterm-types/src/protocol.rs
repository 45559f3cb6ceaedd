use serde::{Deserialize, Serialize};

/// Messages sent from a browser (or the attach client) to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Pong,
    /// Payload that is not a JSON object; forwarded to the PTY verbatim
    Raw(String),
    /// JSON object whose `type` is unknown or whose fields are malformed
    Unrecognized(String),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Pong,
}

impl ClientFrame {
    /// Decode a text frame, falling back to raw input for non-JSON payloads
    pub fn decode(text: &str) -> Self {
        if let Ok(frame) = serde_json::from_str::<TaggedFrame>(text) {
            return match frame {
                TaggedFrame::Input { data } => ClientFrame::Input { data },
                TaggedFrame::Resize { cols, rows } => ClientFrame::Resize { cols, rows },
                TaggedFrame::Ping => ClientFrame::Ping,
                TaggedFrame::Pong => ClientFrame::Pong,
            };
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(map)) if map.contains_key("type") => {
                let kind = map
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                ClientFrame::Unrecognized(kind)
            }
            _ => ClientFrame::Raw(text.to_string()),
        }
    }

    /// Encode for the wire; raw frames are sent as-is
    pub fn encode(&self) -> String {
        let tagged = match self {
            ClientFrame::Raw(text) => return text.clone(),
            ClientFrame::Unrecognized(kind) => {
                return serde_json::json!({ "type": kind }).to_string();
            }
            ClientFrame::Input { data } => TaggedFrame::Input { data: data.clone() },
            ClientFrame::Resize { cols, rows } => TaggedFrame::Resize {
                cols: *cols,
                rows: *rows,
            },
            ClientFrame::Ping => TaggedFrame::Ping,
            ClientFrame::Pong => TaggedFrame::Pong,
        };
        serde_json::to_string(&tagged).unwrap_or_default()
    }
}

/// Control frames sent from the server; PTY output travels as plain text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The shell process exited
    Exit { code: Option<i32> },
    /// The session was reaped for inactivity
    IdleTimeout,
    /// The session was closed on request
    Closed,
    Ping,
    Pong,
    Error { reason: String, message: String },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a text frame as a control frame; `None` means it is terminal output
    pub fn parse(text: &str) -> Option<Self> {
        if !text.starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    /// Whether this frame ends the session for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerFrame::Exit { .. } | ServerFrame::IdleTimeout | ServerFrame::Closed
        )
    }
}
