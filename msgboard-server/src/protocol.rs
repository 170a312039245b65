//! Wire protocol between board clients and the server.
//!
//! Frames:
//! ```text
//! client → server   ClientFrame { id, request }
//! server → client   Reply  { id, result: Ok(response) | Err(WireError) }
//!                   Event  { event: messageAdded | messageUpdated | messageDeleted }
//!                   Closed { error }            observation ended
//! ```
//!
//! The same frames travel as JSON in text messages or bincode in binary
//! messages. Example JSON request:
//! ```text
//! {"id":3,"request":{"addMessage":{"content":"hello"}}}
//! ```

use msgboard_core::{BoardError, DomainEvent, ErrorKind, Request, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Frame encoding, chosen per WebSocket message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON in text frames
    #[default]
    Json,
    /// bincode in binary frames
    Bincode,
}

/// Error as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BoardError> for WireError {
    fn from(err: &BoardError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Client request with a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// Anything the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerFrame {
    Reply {
        id: u64,
        result: Result<Response, WireError>,
    },
    Event {
        event: DomainEvent,
    },
    /// The connection's observation ended; `error` is set on overflow
    Closed {
        error: Option<WireError>,
    },
}

/// Transport errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected reply for request")]
    UnexpectedReply,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
    #[error("Request rejected: {}", .0.message)]
    Rejected(WireError),
}

impl ProtocolError {
    /// Board error kind, if the server rejected the request.
    pub fn rejection_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rejected(wire) => Some(wire.kind),
            _ => None,
        }
    }
}

impl ClientFrame {
    pub fn encode(&self, encoding: Encoding) -> Result<WsMessage, ProtocolError> {
        encode(self, encoding)
    }

    /// Decode a data frame. Control frames yield `Ok(None)`.
    pub fn decode(message: &WsMessage) -> Result<Option<(Self, Encoding)>, ProtocolError> {
        decode(message)
    }
}

impl ServerFrame {
    pub fn encode(&self, encoding: Encoding) -> Result<WsMessage, ProtocolError> {
        encode(self, encoding)
    }

    /// Decode a data frame. Control frames yield `Ok(None)`.
    pub fn decode(message: &WsMessage) -> Result<Option<(Self, Encoding)>, ProtocolError> {
        decode(message)
    }
}

fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<WsMessage, ProtocolError> {
    match encoding {
        Encoding::Json => serde_json::to_string(value)
            .map(|text| WsMessage::Text(text.into()))
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        Encoding::Bincode => bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(|bytes| WsMessage::Binary(bytes.into()))
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
    }
}

fn decode<T: DeserializeOwned>(message: &WsMessage) -> Result<Option<(T, Encoding)>, ProtocolError> {
    match message {
        WsMessage::Text(text) => serde_json::from_str(text.as_str())
            .map(|value| Some((value, Encoding::Json)))
            .map_err(|e| ProtocolError::Deserialization(e.to_string())),
        WsMessage::Binary(bytes) => {
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map(|(value, _)| Some((value, Encoding::Bincode)))
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))
        }
        _ => Ok(None),
    }
}
