//! Asynchronous method channel.
//!
//! Layers request correlation on top of a plain request/reply messenger so a
//! call can be acknowledged quickly and completed later:
//!
//! ```text
//! caller                                   peer
//!   │ start_async_method("m", args)          │
//!   │── m {__job_id, __argument} ───────────►│ handler: result.success(null)
//!   │◄──────────────────────── ack (null) ───│
//!   │            ... later ...               │ result.success_async(value)
//!   │◄──── __result {__job_id, __result} ────│
//!   │── null ───────────────────────────────►│
//!   ▼ PendingResult resolves to value
//! ```
//!
//! Jobs left pending when either side calls [`AsyncMethodChannel::close`],
//! or when the messenger loses its peer, fail with
//! `ASYNCHRONOUS_METHOD_CHANNEL_CLOSE`.

mod dispatch;
mod mock;
mod result;

pub use result::{MethodCallHandler, MethodResult};

use crate::codec::{JsonMethodCodec, MethodCall, MethodCodec, MethodError};
use crate::config::ChannelOptions;
use crate::envelope::Envelope;
use crate::messenger::BinaryMessenger;
use crate::registry::{JobId, JobRegistry, PendingJob};
use crate::{CourierError, Result};
use bytes::Bytes;
use dispatch::ChannelInbound;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{ready, Context, Poll};
use tracing::{debug, info, warn};

type HandlerSlot = RwLock<Option<Arc<dyn MethodCallHandler>>>;

/// State shared by the channel, its messenger registration and result sinks.
pub(crate) struct ChannelCore {
    name: String,
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<dyn MethodCodec>,
    jobs: JobRegistry,
    handler: HandlerSlot,
    mock_handler: HandlerSlot,
    options: ChannelOptions,
    closed: AtomicBool,
}

impl ChannelCore {
    fn handler(&self) -> Option<Arc<dyn MethodCallHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mock_handler(&self) -> Option<Arc<dyn MethodCallHandler>> {
        self.mock_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::ChannelClosed {
                channel: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Hand an encoded call to the mock handler if one is set, else the peer.
    async fn transmit(self: &Arc<Self>, message: Bytes) -> Result<Option<Bytes>> {
        if self.mock_handler().is_some() {
            return mock::transmit(self, message).await;
        }
        self.messenger.send(&self.name, message).await
    }

    fn decode_reply(&self, method: &str, reply: Option<Bytes>) -> Result<Value> {
        let Some(bytes) = reply else {
            return Err(CourierError::NotImplemented {
                method: method.to_string(),
            });
        };
        self.codec
            .decode_envelope(&bytes)?
            .map_err(CourierError::Remote)
    }
}

/// Named method channel with asynchronous result correlation.
///
/// Creating a channel registers it with the messenger under `name`; two
/// channels sharing a name on one messenger replace each other.
pub struct AsyncMethodChannel {
    core: Arc<ChannelCore>,
}

impl AsyncMethodChannel {
    pub fn new(name: impl Into<String>, messenger: Arc<dyn BinaryMessenger>) -> Self {
        Self::with_options(name, messenger, ChannelOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        messenger: Arc<dyn BinaryMessenger>,
        options: ChannelOptions,
    ) -> Self {
        Self::with_codec(name, messenger, Arc::new(JsonMethodCodec), options)
    }

    pub fn with_codec(
        name: impl Into<String>,
        messenger: Arc<dyn BinaryMessenger>,
        codec: Arc<dyn MethodCodec>,
        options: ChannelOptions,
    ) -> Self {
        let core = Arc::new(ChannelCore {
            name: name.into(),
            messenger,
            codec,
            jobs: JobRegistry::new(),
            handler: RwLock::new(None),
            mock_handler: RwLock::new(None),
            options,
            closed: AtomicBool::new(false),
        });

        core.messenger.set_message_handler(
            &core.name,
            Some(Arc::new(ChannelInbound {
                core: Arc::downgrade(&core),
            })),
        );
        debug!(channel = %core.name, "Channel registered");

        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.core.options
    }

    /// Number of asynchronous calls still waiting for their result.
    pub fn pending_jobs(&self) -> usize {
        self.core.jobs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// Install (or clear with `None`) the handler for calls from the peer.
    pub fn set_method_call_handler(&self, handler: Option<Arc<dyn MethodCallHandler>>) {
        *self
            .core
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Install (or clear) a handler that answers this channel's own outbound
    /// calls in place of the peer.
    ///
    /// Calls take the same dispatch path as inbound ones, including deferred
    /// delivery through the job registry, without touching the messenger.
    pub fn set_mock_method_call_handler(&self, handler: Option<Arc<dyn MethodCallHandler>>) {
        *self
            .core
            .mock_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Plain call: the acknowledgement is the result.
    pub async fn invoke_method<T: DeserializeOwned>(&self, method: &str, arguments: Value) -> Result<T> {
        self.core.ensure_open()?;
        ensure_callable(method)?;

        let message = self
            .core
            .codec
            .encode_method_call(&MethodCall::new(method, arguments))?;
        let reply = self.core.transmit(message).await?;
        let value = self.core.decode_reply(method, reply)?;

        Ok(serde_json::from_value(value)?)
    }

    /// Correlated call: wait for the acknowledgement, then return a future
    /// for the deferred result.
    ///
    /// Fails with `ProtocolViolation` if the peer does not acknowledge within
    /// the configured ack timeout. The job is removed on every failure path.
    pub async fn start_async_method<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Value,
    ) -> Result<PendingResult<T>> {
        self.core.ensure_open()?;
        ensure_callable(method)?;

        let (job_id, job) = self.core.jobs.create()?;
        match self.acknowledge(&job_id, method, arguments).await {
            Ok(()) => {
                debug!(channel = %self.core.name, method, job_id = %job_id, "Call acknowledged");
                Ok(PendingResult::new(self.core.name.clone(), job))
            }
            Err(e) => {
                self.core.jobs.remove(&job_id);
                Err(e)
            }
        }
    }

    /// Correlated call resolved to its deferred result.
    pub async fn invoke_async_method<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Value,
    ) -> Result<T> {
        self.start_async_method(method, arguments).await?.await
    }

    async fn acknowledge(&self, job_id: &JobId, method: &str, arguments: Value) -> Result<()> {
        let envelope = Envelope::AsyncCallRequest {
            job_id: job_id.clone(),
            call: MethodCall::new(method, arguments),
        };
        let message = self.core.codec.encode_method_call(&envelope.into_call())?;

        let timeout = self.core.options.ack_timeout;
        let reply = match tokio::time::timeout(timeout, self.core.transmit(message)).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(
                    channel = %self.core.name,
                    method,
                    job_id = %job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call not acknowledged in time"
                );
                return Err(CourierError::ProtocolViolation {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        self.core.decode_reply(method, reply).map(|_| ())
    }

    /// Abandon every pending job, tell the peer, and unregister.
    ///
    /// Idempotent. Local jobs fail with the close code even if the peer cannot
    /// be reached; the returned error only reports the teardown notification.
    pub async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = self.core.drain();
        self.core.messenger.set_message_handler(&self.core.name, None);
        info!(channel = %self.core.name, drained, "Closing channel");

        let message = self
            .core
            .codec
            .encode_method_call(&Envelope::Teardown.into_call())?;
        let timeout = self.core.options.ack_timeout;
        match tokio::time::timeout(timeout, self.core.transmit(message)).await {
            Ok(reply) => reply.map(|_| ()),
            Err(_) => Err(CourierError::Timeout(timeout)),
        }
    }
}

/// Reserved names would be consumed by the peer's correlation layer.
fn ensure_callable(method: &str) -> Result<()> {
    if Envelope::is_reserved(method) {
        return Err(CourierError::ReservedMethod {
            method: method.to_string(),
        });
    }
    Ok(())
}

impl Drop for AsyncMethodChannel {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.core.messenger.set_message_handler(&self.core.name, None);
        }
    }
}

impl std::fmt::Debug for AsyncMethodChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMethodChannel")
            .field("name", &self.core.name)
            .field("pending_jobs", &self.pending_jobs())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Deferred result of an acknowledged asynchronous call.
#[must_use = "dropping a PendingResult discards the deferred result"]
pub struct PendingResult<T> {
    channel: String,
    job: PendingJob,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PendingResult<T> {
    fn new(channel: String, job: PendingJob) -> Self {
        Self {
            channel,
            job,
            _marker: PhantomData,
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.job.job_id()
    }
}

impl<T: DeserializeOwned> Future for PendingResult<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.job).poll(cx));

        Poll::Ready(match outcome {
            Some(Ok(value)) => serde_json::from_value(value).map_err(CourierError::from),
            Some(Err(error)) if error == MethodError::channel_closed() => {
                Err(CourierError::ChannelClosed {
                    channel: self.channel.clone(),
                })
            }
            Some(Err(error)) => Err(CourierError::Remote(error)),
            None => Err(CourierError::ChannelClosed {
                channel: self.channel.clone(),
            }),
        })
    }
}

impl<T> std::fmt::Debug for PendingResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResult")
            .field("channel", &self.channel)
            .field("job_id", self.job.job_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::messenger::StreamMessenger;
    use serde_json::json;
    use std::time::Duration;

    fn channel(name: &str) -> (AsyncMethodChannel, StreamMessenger) {
        let (local, peer) = StreamMessenger::pair();
        (AsyncMethodChannel::new(name, Arc::new(local)), peer)
    }

    #[tokio::test]
    async fn test_new_channel_is_open_and_empty() {
        let (channel, _peer) = channel("demo");
        assert_eq!(channel.name(), "demo");
        assert_eq!(channel.pending_jobs(), 0);
        assert!(!channel.is_closed());
        assert_eq!(channel.options().ack_timeout, ChannelConfig::ACK_TIMEOUT);
    }

    #[tokio::test]
    async fn test_invoke_without_peer_channel_is_not_implemented() {
        let (channel, _peer) = channel("demo");

        let result = channel.invoke_method::<Value>("syncMethod", Value::Null).await;
        assert!(matches!(result, Err(CourierError::NotImplemented { .. })));

        let result = channel
            .start_async_method::<Value>("asynchronousMethod", Value::Null)
            .await;
        assert!(matches!(result, Err(CourierError::NotImplemented { .. })));
        assert_eq!(channel.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_mock_plain_call() {
        let (channel, _peer) = channel("demo");
        channel.set_mock_method_call_handler(Some(Arc::new(
            |call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                assert_eq!(call.method, "getBatteryLevel");
                result.success("100");
                Ok(())
            },
        )));

        let level: String = channel
            .invoke_method("getBatteryLevel", Value::Null)
            .await
            .unwrap();
        assert_eq!(level, "100");
    }

    #[tokio::test]
    async fn test_mock_deferred_result_resolves_through_registry() {
        let (channel, _peer) = channel("demo");
        channel.set_mock_method_call_handler(Some(Arc::new(
            |call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                result.success(Value::Null);
                tokio::spawn(async move {
                    result.success_async(call.arguments).await.unwrap();
                });
                Ok(())
            },
        )));

        let value: Value = channel
            .invoke_async_method("asynchronousMethod", json!({"arg": "arg1"}))
            .await
            .unwrap();
        assert_eq!(value, json!({"arg": "arg1"}));
        assert_eq!(channel.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_reserved_names_never_reach_handler() {
        let (channel, _peer) = channel("demo");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        channel.set_mock_method_call_handler(Some(Arc::new(
            move |_call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                result.success(Value::Null);
                Ok(())
            },
        )));

        for method in ["__result", "__error", "__end"] {
            let err = channel
                .invoke_method::<Value>(method, Value::Null)
                .await
                .unwrap_err();
            assert!(matches!(err, CourierError::ReservedMethod { .. }), "{}", method);

            let err = channel
                .start_async_method::<Value>(method, Value::Null)
                .await
                .unwrap_err();
            assert!(matches!(err, CourierError::ReservedMethod { .. }), "{}", method);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(channel.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_ack_error_removes_job() {
        let (channel, _peer) = channel("demo");
        channel.set_mock_method_call_handler(Some(Arc::new(
            |_call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                result.error("REFUSED", Some("busy".into()), None);
                Ok(())
            },
        )));

        let err = channel
            .start_async_method::<Value>("asynchronousMethod", Value::Null)
            .await
            .unwrap_err();
        match err {
            CourierError::Remote(error) => assert_eq!(error.code, "REFUSED"),
            other => panic!("Expected Remote error, got: {:?}", other),
        }
        assert_eq!(channel.pending_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_call_is_protocol_violation() {
        let (local, _peer) = StreamMessenger::pair();
        let channel = AsyncMethodChannel::with_options(
            "demo",
            Arc::new(local),
            ChannelOptions::default().with_ack_timeout(Duration::from_millis(50)),
        );
        channel.set_mock_method_call_handler(Some(Arc::new(
            |_call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                // Deliver without ever acknowledging.
                tokio::spawn(async move {
                    let _ = result.success_async("early").await;
                });
                Ok(())
            },
        )));

        let err = channel
            .start_async_method::<Value>("asynchronousMethod", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::ProtocolViolation { .. }));
        assert_eq!(channel.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_rejects_new_calls() {
        let (channel, _peer) = channel("demo");
        channel.set_mock_method_call_handler(Some(Arc::new(
            |_call: MethodCall, result: MethodResult| -> anyhow::Result<()> {
                result.success(Value::Null);
                Ok(())
            },
        )));

        let pending = channel
            .start_async_method::<Value>("asynchronousMethod", Value::Null)
            .await
            .unwrap();
        assert_eq!(channel.pending_jobs(), 1);

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        let err = pending.await.unwrap_err();
        assert_eq!(err.to_error_code(), "ASYNCHRONOUS_METHOD_CHANNEL_CLOSE");
        assert_eq!(channel.pending_jobs(), 0);

        let err = channel
            .invoke_method::<Value>("syncMethod", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::ChannelClosed { .. }));
    }
}
