//! Result sink handed to method call handlers.
//!
//! A [`MethodResult`] answers one inbound call. `success` / `error` /
//! `not_implemented` reply to the transport-level call and must happen quickly.
//! For calls that carry a job id, `success_async` / `error_async` deliver the
//! real result later as a separate `__result` / `__error` call to the peer.
//!
//! ```rust,ignore
//! channel.set_method_call_handler(Some(Arc::new(
//!     |call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
//!         result.success(Value::Null);
//!         tokio::spawn(async move {
//!             let value = slow_work(call.arguments).await;
//!             let _ = result.success_async(value).await;
//!         });
//!         Ok(())
//!     },
//! )));
//! ```
//!
//! The contract is enforced at runtime: a second acknowledgement is ignored, a
//! second deferred delivery is rejected with `HandlerMisuse`.

use super::ChannelCore;
use crate::codec::{MethodCall, MethodCodec, MethodError, Reply};
use crate::config::ChannelConfig;
use crate::envelope::{Envelope, ERROR_METHOD, RESULT_METHOD};
use crate::messenger::frame::MAX_REPLY_LEN;
use crate::messenger::{BinaryMessenger, BinaryReply};
use crate::registry::JobId;
use crate::{CourierError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

/// Handles method calls arriving on a channel.
///
/// Runs on the messenger's dispatch task: reply or hand `result` to a spawned
/// task, never block. Returning an error (or panicking) is reported to the
/// caller as an `INTERNAL_ERROR` failure.
pub trait MethodCallHandler: Send + Sync + 'static {
    fn on_method_call(&self, call: MethodCall, result: MethodResult) -> anyhow::Result<()>;
}

impl<F> MethodCallHandler for F
where
    F: Fn(MethodCall, MethodResult) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_method_call(&self, call: MethodCall, result: MethodResult) -> anyhow::Result<()> {
        self(call, result)
    }
}

/// Where deferred `__result` / `__error` envelopes go.
pub(crate) enum DeliveryRoute {
    /// Back over the messenger to the peer that made the call.
    Remote {
        messenger: Arc<dyn BinaryMessenger>,
        channel: String,
    },
    /// Into this channel's own registry (mock harness).
    Local {
        core: Weak<ChannelCore>,
        channel: String,
    },
}

struct ResultState {
    method: String,
    job_id: Option<JobId>,
    codec: Arc<dyn MethodCodec>,
    route: DeliveryRoute,
    ack: Mutex<Option<BinaryReply>>,
    accepted: AtomicBool,
    delivered: AtomicBool,
}

impl ResultState {
    fn ack(&self) -> MutexGuard<'_, Option<BinaryReply>> {
        self.ack.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResultState {
    fn drop(&mut self) {
        if let Some(job_id) = &self.job_id {
            if *self.accepted.get_mut() && !*self.delivered.get_mut() {
                warn!(
                    method = %self.method,
                    job_id = %job_id,
                    "Call accepted but no result delivered; the caller waits until teardown"
                );
            }
        }
    }
}

/// Four-operation result sink for one inbound call.
pub struct MethodResult {
    state: Arc<ResultState>,
}

impl MethodResult {
    pub(crate) fn new(
        method: String,
        job_id: Option<JobId>,
        codec: Arc<dyn MethodCodec>,
        route: DeliveryRoute,
        reply: BinaryReply,
    ) -> Self {
        Self {
            state: Arc::new(ResultState {
                method,
                job_id,
                codec,
                route,
                ack: Mutex::new(Some(reply)),
                accepted: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
            }),
        }
    }

    /// Second handle on the same sink, kept by the dispatch boundary.
    pub(crate) fn handle(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }

    pub fn method(&self) -> &str {
        &self.state.method
    }

    /// Job id of a correlated call, `None` for a plain call.
    pub fn job_id(&self) -> Option<&JobId> {
        self.state.job_id.as_ref()
    }

    /// Whether the caller expects a deferred delivery.
    pub fn is_deferred(&self) -> bool {
        self.state.job_id.is_some()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state.ack().is_none()
    }

    pub fn is_delivered(&self) -> bool {
        self.state.delivered.load(Ordering::SeqCst)
    }

    /// Reply to the transport-level call with a value.
    pub fn success(&self, value: impl Into<Value>) {
        self.acknowledge(Ok(value.into()));
    }

    /// Reply to the transport-level call with a failure.
    pub fn error(&self, code: impl Into<String>, message: Option<String>, details: Option<Value>) {
        self.acknowledge(Err(MethodError::new(code, message, details)));
    }

    /// Tell the caller this method is not handled here.
    pub fn not_implemented(&self) {
        match self.state.ack().take() {
            Some(reply) => reply.send(None),
            None => self.warn_already_acknowledged(),
        }
    }

    /// Deliver the real result of a correlated call.
    ///
    /// Resolves once the peer has accepted the `__result` envelope.
    pub async fn success_async(&self, value: impl Into<Value>) -> Result<()> {
        self.deliver(Ok(value.into())).await
    }

    /// Deliver the real failure of a correlated call.
    pub async fn error_async(
        &self,
        code: impl Into<String>,
        message: Option<String>,
        details: Option<Value>,
    ) -> Result<()> {
        self.deliver(Err(MethodError::new(code, message, details)))
            .await
    }

    fn acknowledge(&self, reply: Reply) -> bool {
        let Some(binary_reply) = self.state.ack().take() else {
            self.warn_already_acknowledged();
            return false;
        };

        let codec = &self.state.codec;
        let encoded = match &reply {
            Ok(value) => codec.encode_success_envelope(value),
            Err(error) => codec.encode_error_envelope(error),
        };

        let fallback = match encoded {
            Ok(bytes) if bytes.len() <= MAX_REPLY_LEN => {
                self.state.accepted.store(reply.is_ok(), Ordering::SeqCst);
                binary_reply.send(Some(bytes));
                return true;
            }
            Ok(bytes) => {
                warn!(
                    method = %self.state.method,
                    size = bytes.len(),
                    "Reply too large for one frame; sending an error instead"
                );
                MethodError::new(
                    ChannelConfig::CODEC_ERROR_CODE,
                    Some(format!(
                        "reply of {} bytes exceeds maximum {}",
                        bytes.len(),
                        MAX_REPLY_LEN
                    )),
                    None,
                )
            }
            Err(e) => {
                error!(method = %self.state.method, error = %e, "Failed to encode reply");
                MethodError::new(ChannelConfig::INTERNAL_ERROR_CODE, Some(e.to_string()), None)
            }
        };

        match codec.encode_error_envelope(&fallback) {
            Ok(bytes) => binary_reply.send(Some(bytes)),
            Err(_) => binary_reply.send(None),
        }
        true
    }

    fn warn_already_acknowledged(&self) {
        warn!(
            method = %self.state.method,
            "Call already acknowledged; ignoring second reply"
        );
    }

    async fn deliver(&self, outcome: Reply) -> Result<()> {
        let Some(job_id) = self.state.job_id.clone() else {
            return self.deliver_inline(outcome);
        };

        if self.state.delivered.swap(true, Ordering::SeqCst) {
            warn!(method = %self.state.method, job_id = %job_id, "Deferred result delivered twice");
            return Err(CourierError::HandlerMisuse {
                message: format!("result for job {} was already delivered", job_id),
            });
        }

        if !self.is_acknowledged() {
            warn!(
                method = %self.state.method,
                job_id = %job_id,
                "Deferred result sent before acknowledging the call; the transport-level call stays pending"
            );
        }

        let (reserved, envelope) = match outcome {
            Ok(result) => (
                RESULT_METHOD,
                Envelope::ResultDelivery {
                    job_id: job_id.clone(),
                    result,
                },
            ),
            Err(error) => (
                ERROR_METHOD,
                Envelope::ErrorDelivery {
                    job_id: job_id.clone(),
                    error,
                },
            ),
        };
        let message = self.state.codec.encode_method_call(&envelope.into_call())?;

        match &self.state.route {
            DeliveryRoute::Remote { messenger, channel } => {
                let reply = match messenger.send(channel, message).await {
                    Err(CourierError::Frame { message: problem }) => {
                        return self
                            .deliver_unsendable(messenger.as_ref(), channel, job_id, problem)
                            .await;
                    }
                    sent => sent?,
                };
                match reply {
                    Some(bytes) => self
                        .state
                        .codec
                        .decode_envelope(&bytes)?
                        .map(|_| ())
                        .map_err(CourierError::Remote),
                    None => Err(CourierError::NotImplemented {
                        method: reserved.to_string(),
                    }),
                }
            }
            DeliveryRoute::Local { core, channel } => {
                let core = core.upgrade().ok_or_else(|| CourierError::ChannelClosed {
                    channel: channel.clone(),
                })?;
                core.handle_local_delivery(message);
                Ok(())
            }
        }
    }

    /// The delivery could not be framed. Fail the job with a codec error so
    /// the caller is not left waiting, and report the original problem.
    async fn deliver_unsendable(
        &self,
        messenger: &dyn BinaryMessenger,
        channel: &str,
        job_id: JobId,
        problem: String,
    ) -> Result<()> {
        warn!(
            method = %self.state.method,
            job_id = %job_id,
            error = %problem,
            "Deferred result cannot be sent; delivering a codec error instead"
        );
        let error = MethodError::new(ChannelConfig::CODEC_ERROR_CODE, Some(problem.clone()), None);
        let message = self
            .state
            .codec
            .encode_method_call(&Envelope::ErrorDelivery { job_id, error }.into_call())?;
        messenger.send(channel, message).await?;

        Err(CourierError::Frame { message: problem })
    }

    /// A plain call has no job: a deferred reply can only go inline.
    fn deliver_inline(&self, outcome: Reply) -> Result<()> {
        if self.is_acknowledged() {
            return Err(CourierError::HandlerMisuse {
                message: format!(
                    "'{}' is not a correlated call and was already answered",
                    self.state.method
                ),
            });
        }

        debug!(method = %self.state.method, "Deferred reply on a plain call sent inline");
        self.acknowledge(outcome);
        Ok(())
    }

    /// Report a handler failure without letting it escape dispatch.
    pub(crate) fn fail_internal(self, message: String) {
        let error = MethodError::new(ChannelConfig::INTERNAL_ERROR_CODE, Some(message), None);

        if !self.is_acknowledged() {
            self.acknowledge(Err(error));
        } else if self.is_deferred() && !self.is_delivered() {
            tokio::spawn(async move {
                let method = self.method().to_string();
                if let Err(e) = self.deliver(Err(error)).await {
                    warn!(method = %method, error = %e, "Failed to deliver handler failure");
                }
            });
        } else {
            debug!(method = %self.state.method, "Handler failed after fully answering the call");
        }
    }
}

impl std::fmt::Debug for MethodResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodResult")
            .field("method", &self.state.method)
            .field("job_id", &self.state.job_id)
            .field("acknowledged", &self.is_acknowledged())
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonMethodCodec;
    use crate::messenger::StreamMessenger;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn capture_reply() -> (BinaryReply, oneshot::Receiver<Option<Bytes>>) {
        let (sender, receiver) = oneshot::channel();
        let reply = BinaryReply::new("test", move |reply| {
            let _ = sender.send(reply);
        });
        (reply, receiver)
    }

    fn plain_result(reply: BinaryReply) -> MethodResult {
        let (messenger, _peer) = StreamMessenger::pair();
        MethodResult::new(
            "syncMethod".to_string(),
            None,
            Arc::new(JsonMethodCodec),
            DeliveryRoute::Remote {
                messenger: Arc::new(messenger),
                channel: "test".to_string(),
            },
            reply,
        )
    }

    fn decode(bytes: Option<Bytes>) -> Reply {
        JsonMethodCodec.decode_envelope(&bytes.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_success_replies_once() {
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        result.success("ok");
        result.success("ignored");

        assert!(result.is_acknowledged());
        assert_eq!(decode(receiver.await.unwrap()), Ok(json!("ok")));
    }

    #[tokio::test]
    async fn test_error_reply_carries_payload() {
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        result.error("UNAVAILABLE", Some("no battery".into()), Some(json!({"retry": false})));

        let error = decode(receiver.await.unwrap()).unwrap_err();
        assert_eq!(error.code, "UNAVAILABLE");
        assert_eq!(error.details, Some(json!({"retry": false})));
    }

    #[tokio::test]
    async fn test_not_implemented_sends_empty_reply() {
        let (reply, receiver) = capture_reply();
        plain_result(reply).not_implemented();
        assert!(receiver.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plain_call_deferred_reply_goes_inline() {
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        result.success_async("late").await.unwrap();
        assert_eq!(decode(receiver.await.unwrap()), Ok(json!("late")));

        let again = result.success_async("later").await;
        assert!(matches!(again, Err(CourierError::HandlerMisuse { .. })));
    }

    #[tokio::test]
    async fn test_oversized_success_becomes_codec_error() {
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        result.success("x".repeat(MAX_REPLY_LEN));

        let bytes = receiver.await.unwrap().unwrap();
        assert!(bytes.len() <= MAX_REPLY_LEN);
        let error = JsonMethodCodec.decode_envelope(&bytes).unwrap().unwrap_err();
        assert_eq!(error.code, "CODEC_ERROR");
    }

    #[tokio::test]
    async fn test_fail_internal_before_ack_sends_internal_error() {
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        result.handle().fail_internal("boom".to_string());

        let error = decode(receiver.await.unwrap()).unwrap_err();
        assert_eq!(error.code, "INTERNAL_ERROR");
        assert_eq!(error.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_closure_implements_handler() {
        let handler = |call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
            result.success(call.arguments);
            Ok(())
        };
        let (reply, receiver) = capture_reply();
        let result = plain_result(reply);

        handler
            .on_method_call(MethodCall::new("syncMethod", json!(3)), result)
            .unwrap();
        assert_eq!(decode(receiver.await.unwrap()), Ok(json!(3)));
    }
}
