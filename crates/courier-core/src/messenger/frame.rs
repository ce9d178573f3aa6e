//! Messenger wire format.
//!
//! Every frame is a 4-byte big-endian length prefix followed by the body:
//!
//! ```text
//! [u32 BE: len][u8 kind][u64 BE seq][kind-specific payload]
//!
//! kind 1 (call):         [u16 BE: name len][channel name UTF-8][message bytes]
//! kind 2 (reply):        [reply bytes]
//! kind 3 (empty reply):  (nothing; the peer had no handler)
//! ```
//!
//! `seq` is chosen by the caller and echoed by the reply.

use crate::config::ChannelConfig;
use crate::{CourierError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_CALL: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_EMPTY_REPLY: u8 = 3;

const HEADER_LEN: usize = 1 + 8;

/// Largest reply payload that fits in one frame.
pub const MAX_REPLY_LEN: usize = ChannelConfig::MAX_FRAME_SIZE - HEADER_LEN;

/// Body length of a call frame carrying `message_len` bytes on `channel`.
pub fn call_frame_len(channel: &str, message_len: usize) -> usize {
    HEADER_LEN + 2 + channel.len() + message_len
}

/// One decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        seq: u64,
        channel: String,
        message: Bytes,
    },
    Reply {
        seq: u64,
        reply: Option<Bytes>,
    },
}

impl Frame {
    /// Encode the frame body (without the length prefix).
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Frame::Call {
                seq,
                channel,
                message,
            } => {
                if channel.len() > ChannelConfig::MAX_CHANNEL_NAME_LEN {
                    return Err(CourierError::Frame {
                        message: format!("channel name of {} bytes is too long", channel.len()),
                    });
                }
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 2 + channel.len() + message.len());
                buf.put_u8(KIND_CALL);
                buf.put_u64(*seq);
                buf.put_u16(channel.len() as u16);
                buf.put_slice(channel.as_bytes());
                buf.put_slice(message);
                Ok(buf.freeze())
            }
            Frame::Reply { seq, reply } => {
                let payload_len = reply.as_ref().map_or(0, Bytes::len);
                let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
                match reply {
                    Some(reply) => {
                        buf.put_u8(KIND_REPLY);
                        buf.put_u64(*seq);
                        buf.put_slice(reply);
                    }
                    None => {
                        buf.put_u8(KIND_EMPTY_REPLY);
                        buf.put_u64(*seq);
                    }
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Decode a frame body read by [`read_frame`].
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.remaining() < HEADER_LEN {
            return Err(invalid(format!("frame of {} bytes has no header", body.len())));
        }
        let kind = body.get_u8();
        let seq = body.get_u64();

        match kind {
            KIND_CALL => {
                if body.remaining() < 2 {
                    return Err(invalid("call frame has no channel name".to_string()));
                }
                let name_len = body.get_u16() as usize;
                if body.remaining() < name_len {
                    return Err(invalid(format!(
                        "channel name length {} exceeds frame",
                        name_len
                    )));
                }
                let name = body.split_to(name_len);
                let channel = String::from_utf8(name.to_vec())
                    .map_err(|_| invalid("channel name is not UTF-8".to_string()))?;
                Ok(Frame::Call {
                    seq,
                    channel,
                    message: body,
                })
            }
            KIND_REPLY => Ok(Frame::Reply {
                seq,
                reply: Some(body),
            }),
            KIND_EMPTY_REPLY => Ok(Frame::Reply { seq, reply: None }),
            other => Err(invalid(format!("unknown frame kind {}", other))),
        }
    }
}

fn invalid(message: String) -> CourierError {
    CourierError::Frame { message }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ChannelConfig::MAX_FRAME_SIZE {
        return Err(CourierError::Frame {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ChannelConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Bytes::from(payload)))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ChannelConfig::MAX_FRAME_SIZE {
        return Err(CourierError::Frame {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                ChannelConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame_layout() {
        let frame = Frame::Call {
            seq: 7,
            channel: "demo".to_string(),
            message: Bytes::from_static(b"{}"),
        };
        let body = frame.encode().unwrap();

        assert_eq!(body[0], KIND_CALL);
        assert_eq!(&body[1..9], &7u64.to_be_bytes());
        assert_eq!(&body[9..11], &4u16.to_be_bytes());
        assert_eq!(&body[11..15], b"demo");
        assert_eq!(&body[15..], b"{}");
        assert_eq!(Frame::decode(body).unwrap(), frame);
    }

    #[test]
    fn test_empty_reply_is_distinct_from_empty_payload() {
        let empty = Frame::Reply { seq: 1, reply: None };
        let blank = Frame::Reply {
            seq: 1,
            reply: Some(Bytes::new()),
        };

        assert_eq!(Frame::decode(empty.encode().unwrap()).unwrap(), empty);
        assert_eq!(Frame::decode(blank.encode().unwrap()).unwrap(), blank);
    }

    #[test]
    fn test_decode_truncated_header_fails() {
        let result = Frame::decode(Bytes::from_static(&[KIND_CALL, 0, 0]));
        assert!(matches!(result, Err(CourierError::Frame { .. })));
    }

    #[test]
    fn test_decode_name_longer_than_frame_fails() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_CALL);
        buf.put_u64(1);
        buf.put_u16(50);
        buf.put_slice(b"short");
        assert!(Frame::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_decode_unknown_kind_fails() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u64(1);
        assert!(Frame::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_call_frame_len_matches_encoding() {
        let frame = Frame::Call {
            seq: 3,
            channel: "demo".to_string(),
            message: Bytes::from_static(b"[1,2,3]"),
        };
        assert_eq!(frame.encode().unwrap().len(), call_frame_len("demo", 7));

        let reply = Frame::Reply {
            seq: 3,
            reply: Some(Bytes::from_static(b"{}")),
        };
        assert_eq!(
            reply.encode().unwrap().len(),
            ChannelConfig::MAX_FRAME_SIZE - MAX_REPLY_LEN + 2
        );
    }

    #[tokio::test]
    async fn test_oversized_write_leaves_writer_untouched() {
        let payload = vec![0u8; ChannelConfig::MAX_FRAME_SIZE + 1];
        let mut buf = Vec::new();

        let result = write_frame(&mut buf, &payload).await;
        assert!(matches!(result, Err(CourierError::Frame { .. })));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back.as_deref(), Some(&payload[..]));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        // Header claims more than the maximum frame size
        let huge_len: u32 = (ChannelConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
