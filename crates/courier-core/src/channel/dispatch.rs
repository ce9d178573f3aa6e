//! Inbound dispatch: decode, route reserved envelopes, invoke handlers.

use super::result::{DeliveryRoute, MethodCallHandler, MethodResult};
use super::ChannelCore;
use crate::codec::{MethodCall, MethodError};
use crate::config::ChannelConfig;
use crate::envelope::Envelope;
use crate::messenger::{BinaryMessageHandler, BinaryReply};
use crate::registry::JobId;
use crate::Result;
use bytes::Bytes;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Which side of the channel a message entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Delivered by the messenger from the peer.
    Messenger,
    /// Short-circuited from this channel's own outbound path.
    Mock,
}

/// Registration held by the messenger for one channel name.
pub(crate) struct ChannelInbound {
    pub(crate) core: Weak<ChannelCore>,
}

impl BinaryMessageHandler for ChannelInbound {
    fn on_message(&self, message: Bytes, reply: BinaryReply) {
        match self.core.upgrade() {
            Some(core) => core.handle_inbound(message, reply, Source::Messenger),
            None => reply.send(None),
        }
    }

    fn on_close(&self) {
        if let Some(core) = self.core.upgrade() {
            let drained = core.drain();
            if drained > 0 {
                info!(channel = %core.name, drained, "Messenger closed; pending jobs abandoned");
            }
        }
    }
}

impl ChannelCore {
    pub(crate) fn handle_inbound(self: &Arc<Self>, message: Bytes, reply: BinaryReply, source: Source) {
        let envelope = match self.decode_inbound(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %self.name, error = %e, "Dropping malformed inbound call");
                self.reply_error(reply, e.to_method_error());
                return;
            }
        };

        match envelope {
            Envelope::PlainCall(call) => self.dispatch_call(call, None, reply, source),
            Envelope::AsyncCallRequest { job_id, call } => {
                self.dispatch_call(call, Some(job_id), reply, source)
            }
            Envelope::ResultDelivery { job_id, result } => {
                if !self.jobs.resolve(&job_id, result) {
                    self.warn_unknown_job(&job_id);
                }
                self.reply_value(reply, &Value::Null);
            }
            Envelope::ErrorDelivery { job_id, error } => {
                if !self.jobs.reject(&job_id, error) {
                    self.warn_unknown_job(&job_id);
                }
                self.reply_value(reply, &Value::Null);
            }
            Envelope::Teardown => {
                let drained = self.drain();
                info!(channel = %self.name, drained, "Peer closed channel");
                self.reply_value(reply, &Value::Null);
            }
        }
    }

    /// Feed a deferred delivery produced by a mock handler straight back in.
    pub(crate) fn handle_local_delivery(self: &Arc<Self>, message: Bytes) {
        self.handle_inbound(message, BinaryReply::detached(self.name.as_str()), Source::Mock);
    }

    pub(crate) fn drain(&self) -> usize {
        self.jobs.drain_with_error(
            ChannelConfig::CLOSE_ERROR_CODE,
            ChannelConfig::CLOSE_ERROR_MESSAGE,
        )
    }

    fn decode_inbound(&self, message: &[u8]) -> Result<Envelope> {
        let call = self.codec.decode_method_call(message)?;
        Envelope::decode(call)
    }

    fn dispatch_call(
        self: &Arc<Self>,
        call: MethodCall,
        job_id: Option<JobId>,
        reply: BinaryReply,
        source: Source,
    ) {
        let handler = match source {
            Source::Messenger => self.handler(),
            Source::Mock => self.mock_handler(),
        };
        let Some(handler) = handler else {
            debug!(channel = %self.name, method = %call.method, "No handler registered");
            reply.send(None);
            return;
        };

        let route = match source {
            Source::Messenger => DeliveryRoute::Remote {
                messenger: self.messenger.clone(),
                channel: self.name.clone(),
            },
            Source::Mock => DeliveryRoute::Local {
                core: Arc::downgrade(self),
                channel: self.name.clone(),
            },
        };

        debug!(
            channel = %self.name,
            method = %call.method,
            job_id = ?job_id.as_ref().map(JobId::as_str),
            "Dispatching method call"
        );
        let result = MethodResult::new(
            call.method.clone(),
            job_id,
            self.codec.clone(),
            route,
            reply,
        );
        invoke_handler(handler.as_ref(), call, result);
    }

    fn reply_value(&self, reply: BinaryReply, value: &Value) {
        match self.codec.encode_success_envelope(value) {
            Ok(bytes) => reply.send(Some(bytes)),
            Err(e) => {
                error!(channel = %self.name, error = %e, "Failed to encode reply");
                reply.send(None);
            }
        }
    }

    fn reply_error(&self, reply: BinaryReply, error: MethodError) {
        match self.codec.encode_error_envelope(&error) {
            Ok(bytes) => reply.send(Some(bytes)),
            Err(e) => {
                error!(channel = %self.name, error = %e, "Failed to encode error reply");
                reply.send(None);
            }
        }
    }

    fn warn_unknown_job(&self, job_id: &JobId) {
        warn!(
            channel = %self.name,
            job_id = %job_id,
            "Delivery for unknown or completed job dropped"
        );
    }
}

/// Run a handler without letting its failures escape dispatch.
pub(crate) fn invoke_handler(handler: &dyn MethodCallHandler, call: MethodCall, result: MethodResult) {
    let guard = result.handle();
    let method = call.method.clone();

    let failure = match catch_unwind(AssertUnwindSafe(|| handler.on_method_call(call, result))) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };

    error!(method = %method, error = %failure, "Method call handler failed");
    guard.fail_internal(failure);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
