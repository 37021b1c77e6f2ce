//! Error types for eventlink.
//!
//! All errors are strongly typed using thiserror. Each component has its own
//! enum and `ListenerError` wraps them for callers that drive the whole
//! listener lifecycle.

use thiserror::Error;

use crate::connector::ConnectorState;

/// Login and credential failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Login request failed: {message}")]
    Transport {
        message: String,
    },

    #[error("Login rejected: {message}")]
    Rejected {
        message: String,
    },

    #[error("Malformed login response: {message}")]
    MalformedResponse {
        message: String,
    },
}

/// Failures of a single request/response exchange with the streaming endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Unauthorized (status {status}): {message}")]
    Unauthorized {
        status: u16,
        message: String,
    },

    #[error("Unexpected status {status}: {message}")]
    Status {
        status: u16,
        message: String,
    },

    #[error("Failed to encode request: {message}")]
    Encode {
        message: String,
    },

    #[error("Failed to decode response: {message}")]
    Decode {
        message: String,
    },
}

/// Streaming connector failures (handshake, connect, subscribe).
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Connector is {state}, cannot {operation}")]
    StateConflict {
        state: ConnectorState,
        operation: &'static str,
    },

    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },

    #[error("Handshake rejected: {message}")]
    HandshakeRejected {
        message: String,
    },

    #[error("Subscription to '{channel}' rejected: {message}")]
    SubscribeRejected {
        channel: String,
        message: String,
    },

    #[error("Missing {field} in {channel} reply")]
    MissingReply {
        channel: String,
        field: &'static str,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Bulk result decoding failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed delimited text at line {line}: {message}")]
    Malformed {
        line: usize,
        message: String,
    },

    #[error("Row {row} has {values} values but there are {headings} headings")]
    ArityMismatch {
        row: usize,
        headings: usize,
        values: usize,
    },

    #[error("Duplicate heading '{heading}'")]
    DuplicateHeading {
        heading: String,
    },

    #[error("Unsupported data type for binding: {shape}")]
    UnsupportedShape {
        shape: String,
    },

    #[error("Row {row} cannot be bound: {message}")]
    Conversion {
        row: usize,
        message: String,
    },
}

/// A consumer handler failed while processing an event.
///
/// Contained at the dispatch boundary; it never reaches the transport.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Handler for '{channel}' failed: {message}")]
    HandlerFailed {
        channel: String,
        message: String,
    },

    #[error("Handler for '{channel}' panicked: {message}")]
    HandlerPanicked {
        channel: String,
        message: String,
    },

    #[error("Dispatcher is shut down")]
    Closed,
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Field '{field}' must be greater than zero")]
    Zero {
        field: &'static str,
    },

    #[error("Field '{field}' cannot be empty")]
    Empty {
        field: &'static str,
    },

    #[error("Replay cursor {value} is invalid (must be -2, -1 or a replay id >= 0)")]
    InvalidReplayFrom {
        value: i64,
    },
}

/// Top-level error type for the listener lifecycle.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ListenerError {
    /// Returns true if this is an auth error.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Returns true if this is a connector error.
    #[must_use]
    pub const fn is_connector(&self) -> bool {
        matches!(self, Self::Connector(_))
    }

    /// Returns true if this error reports a state conflict.
    #[must_use]
    pub const fn is_state_conflict(&self) -> bool {
        matches!(self, Self::Connector(ConnectorError::StateConflict { .. }))
    }

    /// Returns true if an external supervisor may reasonably retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(e) => matches!(e, AuthError::Transport { .. }),
            Self::Connector(e) => match e {
                ConnectorError::Timeout { .. } => true,
                ConnectorError::Transport(t) => match t {
                    TransportError::ConnectionFailed { .. } => true,
                    TransportError::Status { status, .. } => *status >= 500,
                    _ => false,
                },
                _ => false,
            },
            Self::Decode(_) | Self::Dispatch(_) | Self::Config(_) => false,
        }
    }
}

/// Result type alias for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;
