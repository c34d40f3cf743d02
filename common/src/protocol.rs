//! Control-channel messages exchanged with the client, and the small JSON
//! types served by the inspection endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::naming;

/// Inbound message on the recorder channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderCommand {
    Start { initial_state: Value },
    Stop { name: Option<String>, impurities: Value },
    /// Anything else – an event envelope to classify.
    Event(Value),
}

impl RecorderCommand {
    /// Parse a text frame.  `startRecording` wins over `stopRecording`;
    /// everything else is an event.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(mut value: Value) -> Self {
        if flag(&value, "startRecording") {
            RecorderCommand::Start {
                initial_state: take_field(&mut value, "initialState"),
            }
        } else if flag(&value, "stopRecording") {
            RecorderCommand::Stop {
                name: naming::name_from_value(value.get("name")),
                impurities: take_field(&mut value, "impurities"),
            }
        } else {
            RecorderCommand::Event(value)
        }
    }
}

/// Inbound message on the replayer channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayerCommand {
    Start { name: Option<String>, raw_session: bool },
    Stop,
    Unknown,
}

impl ReplayerCommand {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(if flag(&value, "startReplaying") {
            ReplayerCommand::Start {
                name: naming::name_from_value(value.get("name")),
                raw_session: flag(&value, "rawSession"),
            }
        } else if flag(&value, "stopReplaying") {
            ReplayerCommand::Stop
        } else {
            ReplayerCommand::Unknown
        })
    }
}

/// First message sent to a client when a replay starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayInit {
    pub initial_state: Value,
    pub impurities: Value,
}

/// Terminal marker sent after the last replayed event.
pub fn done_marker() -> Value {
    json!({ "done": true })
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn take_field(value: &mut Value, key: &str) -> Value {
    value
        .as_object_mut()
        .and_then(|fields| fields.remove(key))
        .unwrap_or(Value::Null)
}

// ── inspection endpoints ─────────────────────────────────────────────────

/// Information about a stored recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub name: String,
    pub size: u64,
    /// ISO-8601 modification timestamp.
    pub modified: String,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub recording: bool,
    pub replaying: bool,
}
