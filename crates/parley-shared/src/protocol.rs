use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::constants::{DOWNLOAD_PATH, MAX_MESSAGE_CHARS};
use crate::types::Identity;

/// Inbound realtime frames. Anything that does not match one of these shapes
/// is a [`ProtocolViolation`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Plain text message
    Text { text: String },

    /// Message referencing a registered file
    File {
        #[serde(default)]
        text: String,
        file_id: Uuid,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Unrecognized message: {0}")]
    Unrecognized(String),

    #[error("Message too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Binary frames are not supported")]
    Binary,

    #[error("Sending too fast")]
    Flooding,
}

impl ClientEvent {
    /// Parse and validate one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolViolation> {
        let event: ClientEvent = serde_json::from_str(raw)
            .map_err(|e| ProtocolViolation::Unrecognized(e.to_string()))?;

        let len = event.text().chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(ProtocolViolation::TooLong {
                len,
                max: MAX_MESSAGE_CHARS,
            });
        }

        Ok(event)
    }

    pub fn text(&self) -> &str {
        match self {
            ClientEvent::Text { text } | ClientEvent::File { text, .. } => text,
        }
    }
}

/// A message from one sender, fanned out to every active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    Text(TextMessage),
    File(FileMessage),
}

impl BroadcastMessage {
    pub fn sender(&self) -> &Identity {
        match self {
            BroadcastMessage::Text(m) => &m.sender,
            BroadcastMessage::File(m) => &m.sender,
        }
    }
}

impl From<BroadcastMessage> for ServerEvent {
    fn from(message: BroadcastMessage) -> Self {
        match message {
            BroadcastMessage::Text(m) => ServerEvent::TextMessage(m),
            BroadcastMessage::File(m) => ServerEvent::FileMessage(m),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextMessage {
    pub sender: Identity,
    pub text: String,
    /// Hub-wide sequence number, assigned at fan-out.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMessage {
    pub sender: Identity,
    pub text: String,
    pub file_id: Uuid,
    /// Display name from the file registry.
    pub file_name: String,
    pub url: String,
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    FileNotFound,
    ProtocolViolation,
}

/// Outbound realtime frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event on every admitted connection.
    Welcome { identity: Identity, peers: usize },

    TextMessage(TextMessage),

    FileMessage(FileMessage),

    /// Delivered to the offending connection only.
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Download URL handed to clients for a registered file.
pub fn download_url(file_id: &Uuid) -> String {
    format!("{DOWNLOAD_PATH}/{file_id}")
}
