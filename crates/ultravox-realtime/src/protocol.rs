//! Defines the JSON message protocol spoken over a call's realtime connection.
//!
//! Every text frame carries one JSON object discriminated by its `type` field.
//! Inbound frames decode into [`ServerMessage`], outbound frames are built from
//! [`ClientMessage`]. Binary frames carry audio and never reach this module.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// `errorType` reported for invocations of tools that have no handler.
pub const UNKNOWN_TOOL_ERROR_TYPE: &str = "undefined";

/// Inbound `type` values this client decodes. Anything else is surfaced as
/// [`ServerMessage::Unhandled`].
const KNOWN_TYPES: [&str; 5] = [
    "state",
    "transcript",
    "client_tool_invocation",
    "playback_clear_buffer",
    "debug",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// The conversation state reported by the remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Listening => "listening",
            CallState::Thinking => "thinking",
            CallState::Speaking => "speaking",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call state '{0}'")]
pub struct UnknownCallState(pub String);

impl FromStr for CallState {
    type Err = UnknownCallState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CallState::Idle),
            "listening" => Ok(CallState::Listening),
            "thinking" => Ok(CallState::Thinking),
            "speaking" => Ok(CallState::Speaking),
            other => Err(UnknownCallState(other.to_string())),
        }
    }
}

/// Messages sent from the remote agent to this client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The agent moved to a new conversation state.
    State { state: String },
    /// Agent or user speech rendered as text, either whole (`text`) or as an
    /// incremental `delta`.
    Transcript {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        delta: Option<String>,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    /// The agent asks this client to run one of its tools.
    ClientToolInvocation {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "invocationId")]
        invocation_id: String,
        #[serde(default)]
        parameters: Option<Map<String, Value>>,
    },
    /// The agent asks the client to drop any buffered audio.
    PlaybackClearBuffer,
    /// Diagnostic output from the remote side.
    Debug {
        #[serde(default)]
        message: Option<Value>,
    },
    /// A frame with an unknown (or missing) `type`.
    #[serde(skip)]
    Unhandled(Option<String>),
}

/// Messages sent from this client to the remote agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A text turn typed by the user.
    InputTextMessage { text: String },
    /// The outcome of a `client_tool_invocation`.
    ClientToolResult(ToolResult),
}

/// The body of a `client_tool_result` envelope.
///
/// Exactly one of `result` or the `error_type`/`error_message` pair is set.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolResult {
    /// A successful result. The handler's value travels as a JSON-encoded string.
    pub fn success(invocation_id: impl Into<String>, value: &Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: Some(value.to_string()),
            error_type: None,
            error_message: None,
        }
    }

    pub fn failure(
        invocation_id: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
        }
    }

    pub fn unknown_tool(invocation_id: impl Into<String>, tool_name: &str) -> Self {
        Self::failure(
            invocation_id,
            UNKNOWN_TOOL_ERROR_TYPE,
            format!("Unknown tool: {}", tool_name),
        )
    }
}

/// Decodes one inbound text frame.
///
/// The frame must be valid JSON. Frames whose `type` is not understood decode to
/// [`ServerMessage::Unhandled`] rather than failing; known types with missing
/// required fields are errors.
pub fn decode(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind {
        Some(ref kind) if KNOWN_TYPES.contains(&kind.as_str()) => {
            Ok(serde_json::from_value(value)?)
        }
        other => Ok(ServerMessage::Unhandled(other)),
    }
}

/// Encodes one outbound message into the text of a frame.
pub fn encode(message: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
