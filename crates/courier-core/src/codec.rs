//! Method call and reply envelope encoding.
//!
//! A messenger only moves bytes. The codec turns a [`MethodCall`] into bytes for
//! the outbound call and turns the single transport-level reply back into either
//! a success value or a [`MethodError`].
//!
//! ```text
//! call:    {"method": "getBatteryLevel", "arguments": null}
//! success: {"result": "100"}
//! error:   {"error": {"code": "UNAVAILABLE", "message": "...", "details": ...}}
//! ```
//!
//! An absent reply (`None` from the messenger) means no handler accepted the
//! call and is never encoded.

use crate::config::ChannelConfig;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named method invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    /// Create a new method call.
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    /// Look up a named argument when the arguments are a JSON object.
    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

/// Failure payload carried by an error reply or an `__error` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(code: impl Into<String>, message: Option<String>, details: Option<Value>) -> Self {
        Self {
            code: code.into(),
            message,
            details,
        }
    }

    /// The failure given to every job abandoned by a teardown.
    pub fn channel_closed() -> Self {
        Self::new(
            ChannelConfig::CLOSE_ERROR_CODE,
            Some(ChannelConfig::CLOSE_ERROR_MESSAGE.to_string()),
            None,
        )
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for MethodError {}

/// Decoded transport-level reply.
pub type Reply = std::result::Result<Value, MethodError>;

/// Encodes method calls and reply envelopes to bytes.
pub trait MethodCodec: Send + Sync + 'static {
    fn encode_method_call(&self, call: &MethodCall) -> Result<Bytes>;

    fn decode_method_call(&self, message: &[u8]) -> Result<MethodCall>;

    fn encode_success_envelope(&self, result: &Value) -> Result<Bytes>;

    fn encode_error_envelope(&self, error: &MethodError) -> Result<Bytes>;

    fn decode_envelope(&self, envelope: &[u8]) -> Result<Reply>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireEnvelope {
    Result(Value),
    Error(MethodError),
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMethodCodec;

impl MethodCodec for JsonMethodCodec {
    fn encode_method_call(&self, call: &MethodCall) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(call)?))
    }

    fn decode_method_call(&self, message: &[u8]) -> Result<MethodCall> {
        Ok(serde_json::from_slice(message)?)
    }

    fn encode_success_envelope(&self, result: &Value) -> Result<Bytes> {
        let envelope = WireEnvelope::Result(result.clone());
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn encode_error_envelope(&self, error: &MethodError) -> Result<Bytes> {
        let envelope = WireEnvelope::Error(error.clone());
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn decode_envelope(&self, envelope: &[u8]) -> Result<Reply> {
        match serde_json::from_slice(envelope)? {
            WireEnvelope::Result(value) => Ok(Ok(value)),
            WireEnvelope::Error(error) => Ok(Err(error)),
        }
    }
}
