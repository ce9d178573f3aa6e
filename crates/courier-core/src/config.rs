//! Centralized configuration for Courier.
//!
//! Protocol constants live on `ChannelConfig`; per-channel overrides go through
//! `ChannelOptions`.

use std::time::Duration;

/// Protocol-level configuration.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Bound on the transport-level acknowledgement of an asynchronous call.
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Error code used to fail outstanding jobs on teardown.
    pub const CLOSE_ERROR_CODE: &'static str = "ASYNCHRONOUS_METHOD_CHANNEL_CLOSE";
    pub const CLOSE_ERROR_MESSAGE: &'static str = "Asynchronous method channel closed";

    /// Error code for failures raised inside a user handler.
    pub const INTERNAL_ERROR_CODE: &'static str = "INTERNAL_ERROR";

    /// Error code for payloads that cannot be encoded or framed.
    pub const CODEC_ERROR_CODE: &'static str = "CODEC_ERROR";

    // Stream messenger limits
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CHANNEL_NAME_LEN: usize = u16::MAX as usize;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Runtime options for one `AsyncMethodChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// How long `invoke_async_method` waits for the remote acknowledgement.
    pub ack_timeout: Duration,
}

impl ChannelOptions {
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ack_timeout: ChannelConfig::ACK_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_use_protocol_ack_timeout() {
        assert_eq!(ChannelOptions::default().ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_with_ack_timeout() {
        let options = ChannelOptions::default().with_ack_timeout(Duration::from_millis(50));
        assert_eq!(options.ack_timeout, Duration::from_millis(50));
    }
}
