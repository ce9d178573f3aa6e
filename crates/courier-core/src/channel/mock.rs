//! In-process delivery for mock method call handlers.

use super::dispatch::Source;
use super::ChannelCore;
use crate::messenger::BinaryReply;
use crate::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Run an outbound call through the mock handler.
///
/// An unanswered call stays pending, same as with a real peer.
pub(super) async fn transmit(core: &Arc<ChannelCore>, message: Bytes) -> Result<Option<Bytes>> {
    let (sender, receiver) = oneshot::channel();
    let reply = BinaryReply::new(core.name.as_str(), move |reply| {
        let _ = sender.send(reply);
    });

    core.handle_inbound(message, reply, Source::Mock);

    match receiver.await {
        Ok(reply) => Ok(reply),
        Err(_) => std::future::pending().await,
    }
}
