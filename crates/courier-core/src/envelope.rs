//! Correlation envelopes carried inside ordinary method calls.
//!
//! The transport only knows method names and arguments, so job metadata rides
//! in the arguments and three method names are reserved:
//!
//! | Envelope           | Method        | Arguments                                          |
//! |--------------------|---------------|----------------------------------------------------|
//! | `PlainCall`        | any           | anything without `__job_id`                        |
//! | `AsyncCallRequest` | inner method  | `{"__job_id": id, "__argument": inner arguments}`  |
//! | `ResultDelivery`   | `__result`    | `{"__job_id": id, "__result": value}`              |
//! | `ErrorDelivery`    | `__error`     | `{"__job_id": id, "code", "message", "details"}`   |
//! | `Teardown`         | `__end`       | none                                               |
//!
//! Decoding happens once, at the channel boundary; nothing past it sees raw
//! reserved fields.

use crate::codec::{MethodCall, MethodError};
use crate::registry::JobId;
use crate::{CourierError, Result};
use serde_json::{Map, Value};

pub const RESULT_METHOD: &str = "__result";
pub const ERROR_METHOD: &str = "__error";
pub const END_METHOD: &str = "__end";

pub const JOB_ID_FIELD: &str = "__job_id";
pub const ARGUMENT_FIELD: &str = "__argument";
pub const RESULT_FIELD: &str = "__result";

const CODE_FIELD: &str = "code";
const MESSAGE_FIELD: &str = "message";
const DETAILS_FIELD: &str = "details";

/// One decoded inbound or outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    PlainCall(MethodCall),
    AsyncCallRequest { job_id: JobId, call: MethodCall },
    ResultDelivery { job_id: JobId, result: Value },
    ErrorDelivery { job_id: JobId, error: MethodError },
    Teardown,
}

impl Envelope {
    /// Whether `method` is one of the names the correlation layer consumes.
    pub fn is_reserved(method: &str) -> bool {
        matches!(method, RESULT_METHOD | ERROR_METHOD | END_METHOD)
    }

    /// Classify a call received from the transport.
    pub fn decode(call: MethodCall) -> Result<Self> {
        if !Envelope::is_reserved(&call.method) {
            return Self::decode_call(call);
        }

        match call.method.as_str() {
            RESULT_METHOD => {
                let job_id = require_job_id(&call)?;
                let result = call
                    .argument(RESULT_FIELD)
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Envelope::ResultDelivery { job_id, result })
            }
            ERROR_METHOD => {
                let job_id = require_job_id(&call)?;
                let code = call
                    .argument(CODE_FIELD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(&call.method, "missing error code"))?;
                let message = call
                    .argument(MESSAGE_FIELD)
                    .and_then(Value::as_str)
                    .map(String::from);
                let details = call
                    .argument(DETAILS_FIELD)
                    .filter(|details| !details.is_null())
                    .cloned();
                Ok(Envelope::ErrorDelivery {
                    job_id,
                    error: MethodError::new(code, message, details),
                })
            }
            _ => Ok(Envelope::Teardown),
        }
    }

    fn decode_call(call: MethodCall) -> Result<Self> {
        let Some(job_id) = job_id_field(&call)? else {
            return Ok(Envelope::PlainCall(call));
        };

        let MethodCall { method, arguments } = call;
        let inner = match arguments {
            Value::Object(mut fields) => fields.remove(ARGUMENT_FIELD).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(Envelope::AsyncCallRequest {
            job_id,
            call: MethodCall::new(method, inner),
        })
    }

    /// Wire form of this envelope.
    pub fn into_call(self) -> MethodCall {
        match self {
            Envelope::PlainCall(call) => call,
            Envelope::AsyncCallRequest { job_id, call } => {
                let mut fields = Map::new();
                fields.insert(JOB_ID_FIELD.into(), Value::String(job_id.to_string()));
                fields.insert(ARGUMENT_FIELD.into(), call.arguments);
                MethodCall::new(call.method, Value::Object(fields))
            }
            Envelope::ResultDelivery { job_id, result } => {
                let mut fields = Map::new();
                fields.insert(JOB_ID_FIELD.into(), Value::String(job_id.to_string()));
                fields.insert(RESULT_FIELD.into(), result);
                MethodCall::new(RESULT_METHOD, Value::Object(fields))
            }
            Envelope::ErrorDelivery { job_id, error } => {
                let mut fields = Map::new();
                fields.insert(JOB_ID_FIELD.into(), Value::String(job_id.to_string()));
                fields.insert(CODE_FIELD.into(), Value::String(error.code));
                if let Some(message) = error.message {
                    fields.insert(MESSAGE_FIELD.into(), Value::String(message));
                }
                if let Some(details) = error.details {
                    fields.insert(DETAILS_FIELD.into(), details);
                }
                MethodCall::new(ERROR_METHOD, Value::Object(fields))
            }
            Envelope::Teardown => MethodCall::new(END_METHOD, Value::Null),
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Envelope::AsyncCallRequest { job_id, .. }
            | Envelope::ResultDelivery { job_id, .. }
            | Envelope::ErrorDelivery { job_id, .. } => Some(job_id),
            Envelope::PlainCall(_) | Envelope::Teardown => None,
        }
    }
}

fn job_id_field(call: &MethodCall) -> Result<Option<JobId>> {
    match call.argument(JOB_ID_FIELD) {
        None => Ok(None),
        Some(Value::String(id)) => Ok(Some(JobId::from(id.as_str()))),
        Some(_) => Err(malformed(&call.method, "job id is not a string")),
    }
}

fn require_job_id(call: &MethodCall) -> Result<JobId> {
    job_id_field(call)?.ok_or_else(|| malformed(&call.method, "missing job id"))
}

fn malformed(method: &str, reason: &str) -> CourierError {
    CourierError::Codec {
        message: format!("Malformed '{}' envelope: {}", method, reason),
        source: None,
    }
}
