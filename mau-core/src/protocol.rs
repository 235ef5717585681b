use std::time::SystemTime;

use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::transport::Connection;

/// ASCII magic bytes that open every mau sync frame.
const MAGIC: &[u8; 5] = b"MAUFS";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SyncRequest = 0x01,
    FileHeader = 0x10,
    FileChunk = 0x11,
    EndOfStream = 0x20,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SyncRequest),
            0x10 => Ok(Self::FileHeader),
            0x11 => Ok(Self::FileChunk),
            0x20 => Ok(Self::EndOfStream),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags, `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))`: a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)`: protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should close the connection.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected MAUFS"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]);
    let payload_len = u32::from_be_bytes([
        buf[OFF_LENGTH],
        buf[OFF_LENGTH + 1],
        buf[OFF_LENGTH + 2],
        buf[OFF_LENGTH + 3],
    ]) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::SyncRequest`] (client → server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    /// Only files modified strictly after this instant are sent.
    pub since: SystemTime,
}

/// Payload for [`MessageType::FileHeader`] (server → client).
///
/// Followed by [`MessageType::FileChunk`] frames carrying exactly `size`
/// bytes of the encrypted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderPayload {
    pub name: String,
    pub modified_at: SystemTime,
    pub size: u64,
}

/// Payload for [`MessageType::Error`] (either direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// [`ErrorPayload::code`] sent when the first frame is not a valid sync request.
pub const ERROR_BAD_REQUEST: &str = "bad_request";
/// [`ErrorPayload::code`] sent when the catalog could not be read.
pub const ERROR_INTERNAL: &str = "internal";

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

// ── Connection helpers ──────────────────────────────────────────────

/// Reads whole frames off a [`Connection`], buffering partial reads.
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD_LEN),
        }
    }

    /// Returns the next frame, or `None` when the peer closed the stream
    /// cleanly between frames.
    pub async fn next_frame<C: Connection>(&mut self, conn: &mut C) -> Result<Option<Frame>> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                ensure!(self.buf.is_empty(), "stream closed in the middle of a frame");
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

pub async fn write_frame<C: Connection>(conn: &mut C, msg_type: MessageType, payload: &[u8]) -> Result<()> {
    ensure!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        payload.len()
    );
    conn.write_all(&encode_frame_to_bytes(msg_type, payload)).await
}

pub async fn write_payload<C: Connection, T: Serialize>(
    conn: &mut C,
    msg_type: MessageType,
    payload: &T,
) -> Result<()> {
    conn.write_all(&encode_payload_frame(msg_type, payload)?).await
}

/// Sends an [`MessageType::Error`] frame.
pub async fn write_error<C: Connection>(conn: &mut C, code: &str, message: &str) -> Result<()> {
    let payload = ErrorPayload {
        code: code.to_owned(),
        message: message.to_owned(),
    };
    write_payload(conn, MessageType::Error, &payload).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    /// Given a frame with an empty payload, when encoded and decoded, then the header and payload match.
    #[test]
    fn given_empty_payload_when_round_tripped_then_frame_matches() {
        let mut buf = encode_frame_to_bytes(MessageType::EndOfStream, &[]);
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::EndOfStream);
        assert_eq!(frame.header.version, VERSION);
        assert_eq!(frame.header.flags, 0);
        assert_eq!(frame.header.payload_length, 0);
        assert!(frame.payload.is_empty());
        assert!(buf.is_empty());
    }

    /// Given a buffer with only a partial header, when decoding, then None is returned and the buffer is untouched.
    #[test]
    fn given_partial_header_when_decoded_then_returns_none() {
        let full = encode_frame_to_bytes(MessageType::SyncRequest, b"{}");
        let mut buf = BytesMut::from(&full[..7]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    /// Given a complete header but truncated payload, when decoding, then None is returned.
    #[test]
    fn given_truncated_payload_when_decoded_then_returns_none() {
        let payload = b"hello world";
        let full = encode_frame_to_bytes(MessageType::FileChunk, payload);
        let partial_len = HEADER_LEN + payload.len() / 2;
        let mut buf = BytesMut::from(&full[..partial_len]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn given_two_frames_in_buffer_when_decoded_then_both_come_out_in_order() {
        let mut buf = encode_frame_to_bytes(MessageType::FileChunk, b"abc");
        encode_frame(MessageType::EndOfStream, &[], &mut buf);
        let first = try_decode_frame(&mut buf).unwrap().unwrap();
        let second = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, b"abc");
        assert_eq!(second.header.msg_type, MessageType::EndOfStream);
        assert!(buf.is_empty());
    }

    #[test]
    fn given_bad_magic_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"WDROP\x01\x01\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn given_unsupported_version_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"MAUFS\xFF\x01\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn given_unknown_message_type_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"MAUFS\x01\xFE\x00\x00\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unknown message type"));
    }

    #[test]
    fn given_oversized_length_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"MAUFS\x01\x11\x00\x00\x00\x01\x00\x01"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("payload too large"));
    }

    /// Given every defined message type code, when converted to u8 and back, then the original variant is preserved.
    #[test]
    fn given_all_message_types_when_converted_to_u8_and_back_then_match() {
        let types = [
            (0x01, MessageType::SyncRequest),
            (0x10, MessageType::FileHeader),
            (0x11, MessageType::FileChunk),
            (0x20, MessageType::EndOfStream),
            (0x7F, MessageType::Error),
        ];
        for (code, expected) in types {
            let parsed = MessageType::try_from(code).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(u8::from(parsed), code);
        }
    }

    #[test]
    fn given_file_header_when_encoded_as_frame_then_frame_round_trips() {
        let payload = FileHeaderPayload {
            name: "hello world.txt".into(),
            modified_at: UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789),
            size: 4242,
        };
        let mut buf = encode_payload_frame(MessageType::FileHeader, &payload).unwrap();
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::FileHeader);
        let decoded: FileHeaderPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn given_wrong_shape_json_when_decoded_then_returns_error() {
        let json = br#"{"code":"oops"}"#;
        assert!(decode_payload::<SyncRequestPayload>(json).is_err());
    }

    /// In-memory connection handing out pre-recorded reads.
    struct ScriptedConnection {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Connection for ScriptedConnection {
        fn peer(&self) -> String {
            "scripted".into()
        }

        fn peer_fingerprint(&self) -> Option<crate::fingerprint::Fingerprint> {
            None
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let Some(next) = self.reads.pop_front() else {
                return Ok(0);
            };
            buf[..next.len()].copy_from_slice(&next);
            Ok(next.len())
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }

        async fn closed(&mut self) {}

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn given_frame_split_across_reads_when_read_then_reassembled() {
        let bytes = encode_frame_to_bytes(MessageType::FileChunk, b"split payload");
        let (a, b) = bytes.split_at(5);
        let mut conn = ScriptedConnection {
            reads: VecDeque::from([a.to_vec(), b.to_vec()]),
            written: Vec::new(),
        };
        let mut reader = FrameReader::new();
        let frame = reader.next_frame(&mut conn).await.unwrap().unwrap();
        assert_eq!(frame.payload, b"split payload");
        assert!(reader.next_frame(&mut conn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn given_stream_closed_mid_frame_when_read_then_error() {
        let bytes = encode_frame_to_bytes(MessageType::FileChunk, b"cut short");
        let mut conn = ScriptedConnection {
            reads: VecDeque::from([bytes[..HEADER_LEN + 2].to_vec()]),
            written: Vec::new(),
        };
        let err = FrameReader::new().next_frame(&mut conn).await.unwrap_err();
        assert!(err.to_string().contains("middle of a frame"));
    }

    #[tokio::test]
    async fn given_error_written_when_decoded_then_code_and_message_match() {
        let mut conn = ScriptedConnection {
            reads: VecDeque::new(),
            written: Vec::new(),
        };
        write_error(&mut conn, "bad_request", "expected a sync request").await.unwrap();
        let mut buf = BytesMut::from(&conn.written[..]);
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Error);
        let payload: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(payload.code, "bad_request");
        assert_eq!(payload.message, "expected a sync request");
    }

    #[tokio::test]
    async fn given_oversized_chunk_when_written_then_rejected() {
        let mut conn = ScriptedConnection {
            reads: VecDeque::new(),
            written: Vec::new(),
        };
        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(write_frame(&mut conn, MessageType::FileChunk, &big).await.is_err());
        assert!(conn.written.is_empty());
    }
}
