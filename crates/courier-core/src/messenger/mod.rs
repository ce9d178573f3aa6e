//! Binary message transport underneath method channels.
//!
//! A messenger delivers `(channel name, bytes)` to the handler registered for
//! that name on the other side and carries back exactly one reply. It knows
//! nothing about methods, jobs or envelopes.
//!
//! # Architecture
//!
//! - **Frame**: length-prefixed wire format shared by both directions
//! - **Stream**: `StreamMessenger`, a full-duplex messenger over any byte stream

pub mod frame;
pub mod stream;

pub use stream::StreamMessenger;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Transport that carries one request and one reply per call.
#[async_trait]
pub trait BinaryMessenger: Send + Sync + 'static {
    /// Send `message` to the peer's handler for `channel` and wait for its reply.
    ///
    /// `Ok(None)` means the peer has no handler for the channel. There is no
    /// timeout here; a handler that never replies leaves the call pending.
    async fn send(&self, channel: &str, message: Bytes) -> Result<Option<Bytes>>;

    /// Register, replace or clear (`None`) the handler for `channel`.
    fn set_message_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryMessageHandler>>);
}

/// Receives messages addressed to one channel name.
pub trait BinaryMessageHandler: Send + Sync + 'static {
    /// Handle one inbound message.
    ///
    /// Runs on the messenger's dispatch task and must not block; slow work
    /// belongs in a spawned task that keeps `reply` until it is ready.
    fn on_message(&self, message: Bytes, reply: BinaryReply);

    /// Called once when the messenger loses its peer or shuts down.
    fn on_close(&self) {}
}

type ReplySender = Box<dyn FnOnce(Option<Bytes>) + Send>;

/// One-shot reply to an inbound message.
///
/// Dropping it without calling [`BinaryReply::send`] leaves the remote call
/// pending forever.
pub struct BinaryReply {
    channel: String,
    sender: Option<ReplySender>,
}

impl BinaryReply {
    pub fn new<F>(channel: impl Into<String>, sender: F) -> Self
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        Self {
            channel: channel.into(),
            sender: Some(Box::new(sender)),
        }
    }

    /// A reply nobody is waiting for.
    pub fn detached(channel: impl Into<String>) -> Self {
        Self::new(channel, |_| {})
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send the reply. `None` tells the caller no handler accepted the message.
    pub fn send(mut self, reply: Option<Bytes>) {
        if let Some(sender) = self.sender.take() {
            sender(reply);
        }
    }
}

impl std::fmt::Debug for BinaryReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryReply")
            .field("channel", &self.channel)
            .field("sent", &self.sender.is_none())
            .finish()
    }
}

impl Drop for BinaryReply {
    fn drop(&mut self) {
        if self.sender.is_some() {
            debug!(
                channel = %self.channel,
                "Reply dropped without being sent; the remote call stays pending"
            );
        }
    }
}
