//! Board data model: messages, topics and the events the store emits.
//!
//! Wire names follow the board schema clients already speak:
//! ```text
//! Message          { "id": "1", "content": "hello" }
//! Topic            "message-added" | "message-updated" | "message-deleted"
//! DomainEvent      { "messageAdded": { "id": "1", "content": "hello" } }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BoardError;

/// A single board message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id, never reused
    pub id: String,
    pub content: String,
}

impl Message {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

/// The fixed set of topics observers can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    MessageAdded,
    MessageUpdated,
    MessageDeleted,
}

impl Topic {
    /// Every topic, in declaration order.
    pub const ALL: [Topic; 3] = [Topic::MessageAdded, Topic::MessageUpdated, Topic::MessageDeleted];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageAdded => "message-added",
            Self::MessageUpdated => "message-updated",
            Self::MessageDeleted => "message-deleted",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| BoardError::InvalidInput(format!("unknown topic '{s}'")))
    }
}

/// A change applied to the store. Each variant travels on exactly one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    #[serde(rename = "messageAdded")]
    Added(Message),
    #[serde(rename = "messageUpdated")]
    Updated(Message),
    #[serde(rename = "messageDeleted")]
    Deleted(Message),
}

impl DomainEvent {
    /// Topic this event is routed on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Added(_) => Topic::MessageAdded,
            Self::Updated(_) => Topic::MessageUpdated,
            Self::Deleted(_) => Topic::MessageDeleted,
        }
    }

    /// The message carried by the event.
    pub fn message(&self) -> &Message {
        match self {
            Self::Added(m) | Self::Updated(m) | Self::Deleted(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Added(m) | Self::Updated(m) | Self::Deleted(m) => m,
        }
    }
}
