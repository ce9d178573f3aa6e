//! Error types for Courier.
//!
//! One error enum covers the transport, the codec and the correlation layer.
//! Remote failures keep the peer's `{code, message, details}` payload intact so
//! callers can match on the code the remote handler chose.

use crate::codec::MethodError;
use crate::registry::JobId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Courier library.
#[derive(Debug, Error)]
pub enum CourierError {
    // Correlation errors
    #[error(
        "Method '{method}' was not acknowledged within {timeout:?}. The remote handler must \
         reply with success or error before going asynchronous, then deliver the real result \
         with success_async or error_async"
    )]
    ProtocolViolation { method: String, timeout: Duration },

    #[error("{0}")]
    Remote(MethodError),

    #[error("Method not implemented: {method}")]
    NotImplemented { method: String },

    #[error("Method name '{method}' is reserved for job correlation")]
    ReservedMethod { method: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    #[error("Handler misuse: {message}")]
    HandlerMisuse { message: String },

    #[error("Job id collision: {0}")]
    JobIdCollision(JobId),

    // Transport errors
    #[error("Messenger disconnected")]
    Disconnected,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid frame: {message}")]
    Frame { message: String },

    // Serialization errors
    #[error("Codec error: {message}")]
    Codec {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Codec {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<MethodError> for CourierError {
    fn from(err: MethodError) -> Self {
        CourierError::Remote(err)
    }
}

impl CourierError {
    /// Error code used when this error is sent to a peer as a `MethodError`.
    ///
    /// Remote errors keep their original code so that relaying a failure
    /// does not rewrite it.
    pub fn to_error_code(&self) -> &str {
        match self {
            CourierError::Remote(err) => &err.code,
            CourierError::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            CourierError::NotImplemented { .. } => "NOT_IMPLEMENTED",
            CourierError::ReservedMethod { .. } => "RESERVED_METHOD",
            CourierError::ChannelClosed { .. } => crate::config::ChannelConfig::CLOSE_ERROR_CODE,
            CourierError::Codec { .. } | CourierError::Frame { .. } => {
                crate::config::ChannelConfig::CODEC_ERROR_CODE
            }
            CourierError::Disconnected | CourierError::Timeout(_) | CourierError::Io { .. } => {
                "TRANSPORT_ERROR"
            }
            _ => crate::config::ChannelConfig::INTERNAL_ERROR_CODE,
        }
    }

    /// Convert into the payload delivered to a peer.
    pub fn to_method_error(&self) -> MethodError {
        match self {
            CourierError::Remote(err) => err.clone(),
            other => MethodError::new(other.to_error_code(), Some(other.to_string()), None),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// A protocol violation is a bug in the remote handler and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Disconnected | CourierError::Timeout(_) | CourierError::Io { .. }
        )
    }
}
