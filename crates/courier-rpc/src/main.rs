//! Courier RPC - demo peer and client for asynchronous method channels.
//!
//! `serve` listens on TCP and answers the demo methods on every connection.
//! `call` connects to a running server, invokes one method and prints the
//! result as JSON.

mod handler;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::{AsyncMethodChannel, ChannelOptions, StreamMessenger};
use handler::DemoHandler;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-rpc")]
#[command(about = "Demo peer and client for courier method channels")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo methods until Ctrl-C
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Channel name to serve
        #[arg(long, default_value = "demo")]
        channel: String,

        /// Delay before deferred results are delivered
        #[arg(long, default_value = "200")]
        result_delay_ms: u64,
    },

    /// Invoke one method on a running server
    Call {
        /// Server address
        #[arg(long)]
        addr: SocketAddr,

        /// Method name
        #[arg(short, long)]
        method: String,

        /// Arguments as JSON
        #[arg(long)]
        args: Option<String>,

        /// Use a correlated call and wait for the deferred result
        #[arg(long = "async")]
        asynchronous: bool,

        /// Channel name to call
        #[arg(long, default_value = "demo")]
        channel: String,

        /// Acknowledgement timeout in milliseconds
        #[arg(long)]
        ack_timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries RPC_PORT and call results.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            channel,
            result_delay_ms,
        } => serve(&host, port, channel, Duration::from_millis(result_delay_ms)).await,
        Command::Call {
            addr,
            method,
            args,
            asynchronous,
            channel,
            ack_timeout_ms,
        } => {
            let arguments = match args {
                Some(raw) => serde_json::from_str(&raw).context("--args is not valid JSON")?,
                None => Value::Null,
            };
            let mut options = ChannelOptions::default();
            if let Some(ms) = ack_timeout_ms {
                options = options.with_ack_timeout(Duration::from_millis(ms));
            }
            call(addr, &channel, &method, arguments, asynchronous, options).await
        }
    }
}

async fn serve(host: &str, port: u16, channel: String, result_delay: Duration) -> Result<()> {
    info!("Starting courier RPC server");

    let handler = Arc::new(DemoHandler::new(result_delay));
    let server = server::start_server(host, port, channel.clone(), handler).await?;

    // Print port for the launching process to read (intentional stdout)
    println!("RPC_PORT={}", server.port());

    info!("Serving channel '{}' on {}", channel, server.addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing channels");
    server.stop().await;

    Ok(())
}

async fn call(
    addr: SocketAddr,
    channel: &str,
    method: &str,
    arguments: Value,
    asynchronous: bool,
    options: ChannelOptions,
) -> Result<()> {
    let messenger = StreamMessenger::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let channel = AsyncMethodChannel::with_options(channel, Arc::new(messenger), options);

    let result: courier::Result<Value> = if asynchronous {
        channel.invoke_async_method(method, arguments).await
    } else {
        channel.invoke_method(method, arguments).await
    };

    let _ = channel.close().await;

    let value = result.with_context(|| format!("'{}' failed", method))?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
