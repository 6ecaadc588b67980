//! Error types and result handling for Plexus.
//!
//! This module provides a unified error type covering every failure mode in
//! the framework, from route registration problems to pub/sub connectivity
//! errors.
//!
//! # Error Categories
//!
//! - **Registration errors**: [`Error::InvalidPattern`] — a route string uses
//!   unrecognized syntax. Raised at startup and fatal to that registration;
//!   a broken route is never silently installed.
//! - **Resolution errors**: [`Error::NoRoute`] — no entry matched a request
//!   path. Recoverable; callers typically answer with a 404.
//! - **Delivery errors**: [`Error::ConnectionNotFound`], [`Error::Closed`] —
//!   a target connection is gone or the registry stopped accepting
//!   registrations. Fan-out recovers from these per handle.
//! - **Protocol errors**: [`Error::WebSocket`], [`Error::InvalidMessage`],
//!   [`Error::Json`] — transport and payload faults.
//! - **Backbone errors**: [`Error::Redis`] — pub/sub bridge failures. These
//!   are logged by the background subscriber and never raised to the
//!   originating application call.
//!
//! # Examples
//!
//! ```
//! use plexus_core::error::{Error, Result};
//!
//! fn check_target(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(Error::custom("target id cannot be empty"));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for Plexus operations.
///
/// Uses [`thiserror`](https://docs.rs/thiserror) to implement
/// `std::error::Error` and provide `From` conversions for the underlying
/// library errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A route string used syntax the pattern compiler cannot tokenize.
    ///
    /// Raised at registration time. The offending pattern (and the reason)
    /// is included in the message.
    #[error("Invalid route pattern: {0}")]
    InvalidPattern(String),

    /// No route entry matched the request path.
    ///
    /// This is not a system fault; the caller decides the default behavior
    /// (usually "not found").
    #[error("No route matched: {0}")]
    NoRoute(String),

    /// A connection lookup failed, usually because the peer disconnected.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// The connection registry has been closed and refuses new
    /// registrations. Raised during graceful shutdown.
    #[error("Registry closed, no new registrations accepted")]
    Closed,

    /// A message payload failed to parse as the expected structured format.
    ///
    /// For auto-dispatch connections this fault closes the connection.
    #[error("Invalid message payload")]
    InvalidMessage,

    /// WebSocket protocol error from the transport layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error from the listener or a stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the Redis pub/sub backbone.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A type alias for `Result<T, Error>` used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error with the given message.
    ///
    /// # Examples
    ///
    /// ```
    /// use plexus_core::error::Error;
    ///
    /// let err = Error::custom("something went wrong");
    /// assert_eq!(err.to_string(), "Custom error: something went wrong");
    /// ```
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates an invalid-pattern error for the given route string and
    /// reason.
    pub fn invalid_pattern(pattern: &str, reason: impl fmt::Display) -> Self {
        Error::InvalidPattern(format!("{pattern}: {reason}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_error() {
        let err = Error::custom("test error");
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(err.to_string(), "Custom error: test error");
    }

    #[test]
    fn test_invalid_message_error() {
        let err = Error::InvalidMessage;
        assert_eq!(err.to_string(), "Invalid message payload");
    }

    #[test]
    fn test_invalid_pattern_error() {
        let err = Error::invalid_pattern("/bad/(:x", "unterminated parameter");
        assert_eq!(
            err.to_string(),
            "Invalid route pattern: /bad/(:x: unterminated parameter"
        );
    }

    #[test]
    fn test_no_route_error() {
        let err = Error::NoRoute("/missing".to_string());
        assert_eq!(err.to_string(), "No route matched: /missing");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::Json(_)));
    }
}
