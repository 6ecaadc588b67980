//! WebSocket frame types and utilities.
//!
//! This module provides the frame abstraction used throughout Plexus. It
//! wraps the underlying message types from `tokio-tungstenite` and provides
//! convenient methods for creating, inspecting, and parsing frames.
//!
//! Most application payloads are text frames carrying JSON; binary frames
//! pass through untouched. Control frames (ping/pong/close) are handled by
//! the connection lifecycle and rarely touched by application code.
//!
//! # Examples
//!
//! ```
//! use plexus_core::message::Message;
//!
//! let greeting = Message::text("hello");
//! assert!(greeting.is_text());
//! assert_eq!(greeting.as_text(), Some("hello"));
//!
//! let blob = Message::binary(vec![0x01, 0x02]);
//! assert!(blob.is_binary());
//! ```

use crate::error::Result;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// The protocol-level type of a WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// UTF-8 text payload. JSON envelopes and auto-dispatch events use this.
    Text,
    /// Raw byte payload.
    Binary,
    /// Keep-alive request.
    Ping,
    /// Keep-alive response.
    Pong,
    /// Graceful connection termination.
    Close,
}

/// A WebSocket message.
///
/// Cheaply cloneable; safe to share across tasks. Fan-out paths clone the
/// message once per target connection.
#[derive(Debug, Clone)]
pub struct Message {
    /// The raw payload. UTF-8 encoded for text frames.
    pub data: Vec<u8>,
    /// The frame type.
    pub msg_type: MessageType,
}

impl Message {
    /// Creates a new text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: text.into().into_bytes(),
            msg_type: MessageType::Text,
        }
    }

    /// Creates a new binary message.
    pub fn binary(data: Vec<u8>) -> Self {
        Self {
            data,
            msg_type: MessageType::Binary,
        }
    }

    /// Returns `true` if this is a text frame.
    pub fn is_text(&self) -> bool {
        self.msg_type == MessageType::Text
    }

    /// Returns `true` if this is a binary frame.
    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// Returns the payload as UTF-8 text, or `None` for non-text frames or
    /// invalid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }

    /// Returns the raw payload bytes regardless of frame type.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Parses the payload as JSON into the requested type.
    ///
    /// # Examples
    ///
    /// ```
    /// use plexus_core::message::Message;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Hello { name: String }
    ///
    /// let msg = Message::text(r#"{"name":"plexus"}"#);
    /// let hello: Hello = msg.json().unwrap();
    /// assert_eq!(hello.name, "plexus");
    /// ```
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Returns the frame type.
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Converts a tungstenite message into a Plexus message.
    pub fn from_tungstenite(msg: TungsteniteMessage) -> Self {
        match msg {
            TungsteniteMessage::Text(text) => Self::text(text),
            TungsteniteMessage::Binary(data) => Self::binary(data),
            TungsteniteMessage::Ping(data) => Self {
                data,
                msg_type: MessageType::Ping,
            },
            TungsteniteMessage::Pong(data) => Self {
                data,
                msg_type: MessageType::Pong,
            },
            TungsteniteMessage::Close(_) => Self {
                data: Vec::new(),
                msg_type: MessageType::Close,
            },
            TungsteniteMessage::Frame(frame) => Self::binary(frame.into_data()),
        }
    }

    /// Converts this message into a tungstenite message.
    pub fn into_tungstenite(self) -> TungsteniteMessage {
        match self.msg_type {
            MessageType::Text => {
                TungsteniteMessage::Text(String::from_utf8_lossy(&self.data).into_owned())
            }
            MessageType::Binary => TungsteniteMessage::Binary(self.data),
            MessageType::Ping => TungsteniteMessage::Ping(self.data),
            MessageType::Pong => TungsteniteMessage::Pong(self.data),
            MessageType::Close => TungsteniteMessage::Close(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message() {
        let msg = Message::text("hello");
        assert!(msg.is_text());
        assert!(!msg.is_binary());
        assert_eq!(msg.as_text(), Some("hello"));
    }

    #[test]
    fn test_binary_message() {
        let msg = Message::binary(vec![1, 2, 3]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_text(), None);
        assert_eq!(msg.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_json_parsing() {
        let msg = Message::text(r#"{"event":"ping"}"#);
        let value: serde_json::Value = msg.json().unwrap();
        assert_eq!(value["event"], "ping");
    }

    #[test]
    fn test_json_parse_failure() {
        let msg = Message::text("not json");
        let parsed: Result<serde_json::Value> = msg.json();
        assert!(parsed.is_err());
    }

    #[test]
    fn test_tungstenite_round_trip() {
        let msg = Message::text("round");
        let tung = msg.into_tungstenite();
        let back = Message::from_tungstenite(tung);
        assert_eq!(back.as_text(), Some("round"));
    }
}
