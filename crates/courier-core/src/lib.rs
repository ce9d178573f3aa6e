//! Courier - asynchronous method channels with deferred results.
//!
//! A plain method channel answers every call exactly once. Courier layers job
//! correlation on top so a handler can acknowledge a call immediately and
//! deliver the real result later, as a separate call back to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier::{AsyncMethodChannel, MethodCall, MethodResult, StreamMessenger};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let messenger = StreamMessenger::connect("127.0.0.1:7420".parse()?).await?;
//!     let channel = AsyncMethodChannel::new("demo", Arc::new(messenger));
//!
//!     // Plain call: the acknowledgement is the result
//!     let level: String = channel.invoke_method("getBatteryLevel", Value::Null).await?;
//!
//!     // Correlated call: acknowledged now, resolved later
//!     let echoed: Value = channel
//!         .invoke_async_method("asynchronousMethod", json!({"arg": "arg1"}))
//!         .await?;
//!
//!     channel.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod messenger;
pub mod registry;

pub use channel::{AsyncMethodChannel, MethodCallHandler, MethodResult, PendingResult};
pub use codec::{JsonMethodCodec, MethodCall, MethodCodec, MethodError, Reply};
pub use config::{ChannelConfig, ChannelOptions};
pub use envelope::Envelope;
pub use error::{CourierError, Result};
pub use messenger::{BinaryMessageHandler, BinaryMessenger, BinaryReply, StreamMessenger};
pub use registry::{JobId, JobRegistry, PendingJob};
