//! Full-duplex messenger over a byte stream.
//!
//! Both ends of the stream can call and be called. Each `StreamMessenger` runs
//! three tasks:
//!
//! - **reader**: reads frames, routes replies to waiting callers and queues
//!   inbound calls
//! - **dispatch**: hands queued calls to channel handlers one at a time, in
//!   arrival order
//! - **writer**: serializes outbound calls and replies onto the stream
//!
//! Handlers never run on the reader task, so a handler that sends a call of its
//! own can still receive that call's reply.

use super::frame::{call_frame_len, read_frame, write_frame, Frame};
use super::{BinaryMessageHandler, BinaryMessenger, BinaryReply};
use crate::config::ChannelConfig;
use crate::{CourierError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type HandlerMap = HashMap<String, Arc<dyn BinaryMessageHandler>>;

struct InboundCall {
    seq: u64,
    channel: String,
    message: Bytes,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Option<Bytes>>>>,
    handlers: RwLock<HandlerMap>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Option<Bytes>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self, channel: &str) -> Option<Arc<dyn BinaryMessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    fn complete(&self, seq: u64, reply: Option<Bytes>) {
        match self.pending().remove(&seq) {
            Some(sender) => {
                if sender.send(reply).is_err() {
                    debug!(seq, "Reply arrived after the caller stopped waiting");
                }
            }
            None => debug!(seq, "Reply for unknown call dropped"),
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Fail in-flight calls and notify handlers. Runs once.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let in_flight = std::mem::take(&mut *self.pending());
        debug!(in_flight = in_flight.len(), "Messenger closed");
        drop(in_flight);
        self.closed_tx.send_replace(true);

        let handlers: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler.on_close();
        }
    }
}

/// Removes the pending entry if the caller stops waiting.
struct InFlight<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.seq);
    }
}

/// Messenger over any `AsyncRead + AsyncWrite` stream.
pub struct StreamMessenger {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamMessenger {
    /// Start a messenger on `stream`. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_tx: watch::channel(false).0,
        });

        let tasks = vec![
            tokio::spawn(Self::reader_loop(reader, shared.clone(), dispatch_tx)),
            tokio::spawn(Self::dispatch_loop(shared.clone(), dispatch_rx)),
            tokio::spawn(Self::writer_loop(writer, shared.clone(), outbound_rx)),
        ];

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    /// Connect to a peer listening on `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CourierError::Timeout(ChannelConfig::CONNECT_TIMEOUT))??;
        stream.set_nodelay(true)?;

        debug!("Messenger connected to {}", addr);
        Ok(Self::new(stream))
    }

    /// Two messengers joined by an in-memory stream.
    pub fn pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        (Self::new(left), Self::new(right))
    }

    /// Returns true once the peer is gone or `shutdown` was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until the messenger is closed.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Stop all tasks, fail in-flight calls and notify handlers.
    pub fn shutdown(&self) {
        self.shared.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    async fn reader_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        shared: Arc<Shared>,
        dispatch: mpsc::UnboundedSender<InboundCall>,
    ) {
        loop {
            let read = tokio::select! {
                read = read_frame(&mut reader) => read,
                _ = shared.wait_closed() => break,
            };
            let body = match read {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!("Messenger stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Messenger read failed");
                    break;
                }
            };

            match Frame::decode(body) {
                Ok(Frame::Reply { seq, reply }) => shared.complete(seq, reply),
                Ok(Frame::Call {
                    seq,
                    channel,
                    message,
                }) => {
                    let call = InboundCall {
                        seq,
                        channel,
                        message,
                    };
                    if dispatch.send(call).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }

        shared.close();
    }

    async fn dispatch_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<InboundCall>) {
        while let Some(call) = inbound.recv().await {
            let outbound = shared.outbound.clone();
            let seq = call.seq;
            let reply = BinaryReply::new(call.channel.clone(), move |reply| {
                if outbound.send(Frame::Reply { seq, reply }).is_err() {
                    debug!(seq, "Reply dropped, messenger writer is gone");
                }
            });

            match shared.handler(&call.channel) {
                Some(handler) => handler.on_message(call.message, reply),
                None => {
                    debug!(channel = %call.channel, "No handler registered for channel");
                    reply.send(None);
                }
            }
        }
    }

    async fn writer_loop<W: AsyncWrite + Unpin>(
        mut writer: W,
        shared: Arc<Shared>,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shared.wait_closed() => break,
            };
            let Some(body) = Self::encode_bounded(&shared, frame) else {
                continue;
            };

            if let Err(e) = write_frame(&mut writer, &body).await {
                warn!(error = %e, "Messenger write failed");
                break;
            }
        }

        // Reader and writer both exit on close, so the stream is dropped and
        // the peer sees EOF.
        shared.close();
    }

    /// Encode `frame`, or handle it locally if it cannot go on the wire.
    ///
    /// An unsendable call fails its caller with `Disconnected`; an unsendable
    /// reply goes out as an empty reply so the peer is never left waiting.
    fn encode_bounded(shared: &Shared, frame: Frame) -> Option<Bytes> {
        let problem = match frame.encode() {
            Ok(body) if body.len() <= ChannelConfig::MAX_FRAME_SIZE => return Some(body),
            Ok(body) => format!(
                "frame size {} exceeds maximum {}",
                body.len(),
                ChannelConfig::MAX_FRAME_SIZE
            ),
            Err(e) => e.to_string(),
        };

        match frame {
            Frame::Call { seq, channel, .. } => {
                warn!(seq, channel = %channel, error = %problem, "Dropping unsendable call");
                shared.pending().remove(&seq);
                None
            }
            Frame::Reply { seq, .. } => {
                warn!(seq, error = %problem, "Replacing unsendable reply with an empty reply");
                Frame::Reply { seq, reply: None }.encode().ok()
            }
        }
    }
}

#[async_trait]
impl BinaryMessenger for StreamMessenger {
    async fn send(&self, channel: &str, message: Bytes) -> Result<Option<Bytes>> {
        if channel.len() > ChannelConfig::MAX_CHANNEL_NAME_LEN {
            return Err(CourierError::Frame {
                message: format!("channel name of {} bytes is too long", channel.len()),
            });
        }
        let frame_len = call_frame_len(channel, message.len());
        if frame_len > ChannelConfig::MAX_FRAME_SIZE {
            warn!(channel, frame_len, "Refusing to send oversized call");
            return Err(CourierError::Frame {
                message: format!(
                    "call of {} bytes exceeds maximum frame size {}",
                    frame_len,
                    ChannelConfig::MAX_FRAME_SIZE
                ),
            });
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        {
            let mut pending = self.shared.pending();
            // Checked under the lock so close() cannot miss this entry.
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(CourierError::Disconnected);
            }
            pending.insert(seq, sender);
        }
        let _in_flight = InFlight {
            shared: &*self.shared,
            seq,
        };

        let frame = Frame::Call {
            seq,
            channel: channel.to_string(),
            message,
        };
        if self.shared.outbound.send(frame).is_err() {
            return Err(CourierError::Disconnected);
        }

        receiver.await.map_err(|_| CourierError::Disconnected)
    }

    fn set_message_handler(&self, channel: &str, handler: Option<Arc<dyn BinaryMessageHandler>>) {
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match handler {
            Some(handler) => {
                if handlers.insert(channel.to_string(), handler).is_some() {
                    debug!(channel, "Replaced channel handler");
                }
            }
            None => {
                handlers.remove(channel);
            }
        }
    }
}

impl Drop for StreamMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::frame::MAX_REPLY_LEN;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Replies with the message it received.
    struct EchoHandler;

    impl BinaryMessageHandler for EchoHandler {
        fn on_message(&self, message: Bytes, reply: BinaryReply) {
            reply.send(Some(message));
        }
    }

    /// Never replies.
    struct SilentHandler;

    impl BinaryMessageHandler for SilentHandler {
        fn on_message(&self, _message: Bytes, _reply: BinaryReply) {}
    }

    /// Replies with one byte more than a frame can carry.
    struct OversizedReplyHandler;

    impl BinaryMessageHandler for OversizedReplyHandler {
        fn on_message(&self, _message: Bytes, reply: BinaryReply) {
            reply.send(Some(Bytes::from(vec![b'x'; MAX_REPLY_LEN + 1])));
        }
    }

    #[derive(Default)]
    struct CloseCounter {
        closes: AtomicUsize,
    }

    impl BinaryMessageHandler for CloseCounter {
        fn on_message(&self, _message: Bytes, reply: BinaryReply) {
            reply.send(None);
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_echo_roundtrip() {
        let (client, server) = StreamMessenger::pair();
        server.set_message_handler("echo", Some(Arc::new(EchoHandler)));

        let reply = client
            .send("echo", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_both_ends_can_call() {
        let (left, right) = StreamMessenger::pair();
        left.set_message_handler("echo", Some(Arc::new(EchoHandler)));
        right.set_message_handler("echo", Some(Arc::new(EchoHandler)));

        let from_left = left.send("echo", Bytes::from_static(b"l")).await.unwrap();
        let from_right = right.send("echo", Bytes::from_static(b"r")).await.unwrap();

        assert_eq!(from_left.as_deref(), Some(&b"l"[..]));
        assert_eq!(from_right.as_deref(), Some(&b"r"[..]));
    }

    #[tokio::test]
    async fn test_unregistered_channel_replies_none() {
        let (client, _server) = StreamMessenger::pair();
        let reply = client.send("missing", Bytes::new()).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_cleared_handler_replies_none() {
        let (client, server) = StreamMessenger::pair();
        server.set_message_handler("echo", Some(Arc::new(EchoHandler)));
        server.set_message_handler("echo", None);

        let reply = client.send("echo", Bytes::new()).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unanswered_call_stays_pending() {
        let (client, server) = StreamMessenger::pair();
        server.set_message_handler("silent", Some(Arc::new(SilentHandler)));

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            client.send("silent", Bytes::new()),
        )
        .await;
        assert!(result.is_err(), "call should still be pending");
    }

    #[tokio::test]
    async fn test_peer_drop_fails_in_flight_and_notifies_handlers() {
        let (client, server) = StreamMessenger::pair();
        let counter = Arc::new(CloseCounter::default());
        client.set_message_handler("watch", Some(counter.clone()));
        server.set_message_handler("silent", Some(Arc::new(SilentHandler)));

        let call = client.send("silent", Bytes::new());
        let dropper = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server);
        };
        let (result, ()) = tokio::join!(call, dropper);

        assert!(matches!(result, Err(CourierError::Disconnected)));
        assert!(client.is_closed());
        assert_eq!(counter.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_resolves_when_peer_goes_away() {
        let (client, server) = StreamMessenger::pair();
        drop(server);

        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .expect("closed() never resolved");
        assert!(client.is_closed());

        // Already closed: returns immediately.
        client.closed().await;
    }

    #[tokio::test]
    async fn test_oversized_call_fails_and_connection_survives() {
        let (client, server) = StreamMessenger::pair();
        server.set_message_handler("echo", Some(Arc::new(EchoHandler)));

        let huge = Bytes::from(vec![b'x'; ChannelConfig::MAX_FRAME_SIZE]);
        let result = tokio::time::timeout(Duration::from_secs(5), client.send("echo", huge))
            .await
            .expect("oversized call hung");
        assert!(matches!(result, Err(CourierError::Frame { .. })));
        assert!(!client.is_closed());

        let reply = client
            .send("echo", Bytes::from_static(b"after"))
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some(&b"after"[..]));
    }

    #[tokio::test]
    async fn test_oversized_reply_arrives_empty() {
        let (client, server) = StreamMessenger::pair();
        server.set_message_handler("big", Some(Arc::new(OversizedReplyHandler)));
        server.set_message_handler("echo", Some(Arc::new(EchoHandler)));

        let reply = tokio::time::timeout(Duration::from_secs(5), client.send("big", Bytes::new()))
            .await
            .expect("oversized reply hung")
            .unwrap();
        assert!(reply.is_none());

        let reply = client.send("echo", Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"ok"[..]));
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_close_releases_stream_for_peer() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let messenger = StreamMessenger::new(local);

        // Close without aborting the tasks, as a failed write does.
        messenger.shared.close();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .expect("peer never saw the stream close");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_disconnected() {
        let (client, _server) = StreamMessenger::pair();
        client.shutdown();

        let result = client.send("echo", Bytes::new()).await;
        assert!(matches!(result, Err(CourierError::Disconnected)));
    }

    #[tokio::test]
    async fn test_tcp_connect_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let server = StreamMessenger::new(stream);
            server.set_message_handler("echo", Some(Arc::new(EchoHandler)));
            // Keep the server alive until the client is done.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let client = StreamMessenger::connect(addr).await.unwrap();
        let reply = client.send("echo", Bytes::from_static(b"tcp")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"tcp"[..]));

        accept.abort();
    }

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(StreamMessenger::connect(addr).await.is_err());
    }
}
