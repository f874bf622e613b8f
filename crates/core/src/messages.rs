use crate::traits::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of a server push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// First value a subscriber receives for a topic.
    #[serde(rename = "initialData")]
    InitialData,
    /// Value produced by a poll tick.
    #[serde(rename = "update")]
    Update,
    /// The topic could not be served.
    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::InitialData => "initialData",
            MessageType::Update => "update",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope pushed from the hub to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

impl ServerMessage {
    pub fn initial_data(topic: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageType::InitialData,
            topic: topic.into(),
            data,
        }
    }

    pub fn update(topic: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageType::Update,
            topic: topic.into(),
            data,
        }
    }

    /// Error push for a single topic. The payload carries a stable code and
    /// a human-readable message.
    pub fn error(topic: impl Into<String>, err: &SyncError) -> Self {
        Self {
            kind: MessageType::Error,
            topic: topic.into(),
            data: err.to_payload(),
        }
    }
}

/// Control frames sent from a viewer to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl ControlMessage {
    pub fn topic(&self) -> &str {
        match self {
            ControlMessage::Subscribe { topic } | ControlMessage::Unsubscribe { topic } => topic,
        }
    }
}
