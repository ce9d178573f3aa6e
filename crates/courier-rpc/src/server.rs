//! TCP server exposing one method channel per connection.
//!
//! Every accepted connection gets its own `StreamMessenger` and an
//! `AsyncMethodChannel` with the shared handler installed. The channel lives
//! until the peer disconnects or the server shuts down; on shutdown each
//! channel is closed so the peer's pending jobs fail with the close code.

use courier::{AsyncMethodChannel, MethodCallHandler, StreamMessenger};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum number of simultaneous connections.
const MAX_CONNECTIONS: usize = 64;

/// Handle to a running server. Dropping aborts it.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, close every channel and wait for connections to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Server task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Bind `host:port` and serve `channel` on every connection.
pub async fn start_server(
    host: &str,
    port: u16,
    channel: String,
    handler: Arc<dyn MethodCallHandler>,
) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!("Channel server listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task_handle = tokio::spawn(accept_loop(listener, channel, handler, shutdown_rx));

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task_handle: Some(task_handle),
    })
}

async fn accept_loop(
    listener: TcpListener,
    channel: String,
    handler: Arc<dyn MethodCallHandler>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Channel server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                };

                connections.retain(|connection| !connection.is_finished());
                if connections.len() >= MAX_CONNECTIONS {
                    warn!(
                        "Rejecting connection from {}: at max capacity ({})",
                        peer_addr, MAX_CONNECTIONS
                    );
                    continue;
                }

                let channel = channel.clone();
                let handler = handler.clone();
                let conn_shutdown = conn_shutdown_rx.clone();
                connections.push(tokio::spawn(async move {
                    debug!("Connection from {}", peer_addr);
                    serve_connection(stream, channel, handler, conn_shutdown).await;
                    debug!("Connection {} finished", peer_addr);
                }));
            }
        }
    }

    let _ = conn_shutdown_tx.send(true);
    futures::future::join_all(connections).await;
}

async fn serve_connection(
    stream: TcpStream,
    name: String,
    handler: Arc<dyn MethodCallHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let messenger = Arc::new(StreamMessenger::new(stream));
    let channel = AsyncMethodChannel::new(name, messenger.clone());
    channel.set_method_call_handler(Some(handler));

    tokio::select! {
        _ = messenger.closed() => {
            debug!(channel = %channel.name(), "Peer disconnected");
        }
        _ = shutdown_rx.changed() => {
            if let Err(e) = channel.close().await {
                debug!(channel = %channel.name(), error = %e, "Teardown notification failed");
            }
        }
    }

    messenger.shutdown();
}
