//! Binary protocol between the sync client and the config server
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+---------+------------------+
//! | type   | length  | payload          |
//! | 1 byte | 4 bytes | variable         |
//! +--------+---------+------------------+
//! ```
//!
//! Strings are u16-length-prefixed UTF-8, byte blobs are u32-length-prefixed.
//!
//! Message types:
//! - 0x01: Fetch request (product, commit_ref)
//! - 0x02: Fetch response (status:i32, message, archive)
//! - 0x03: Apply request (product, commit_ref, deleted_count:4, deleted paths, archive)
//! - 0x04: Apply response (status:i32, message)
//! - 0x06: Error response (message)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Message type identifiers
pub mod msg {
    pub const FETCH_REQ: u8 = 0x01;
    pub const FETCH_RESP: u8 = 0x02;
    pub const APPLY_REQ: u8 = 0x03;
    pub const APPLY_RESP: u8 = 0x04;
    pub const ERROR: u8 = 0x06;
}

/// Reply status codes; zero is success
pub mod status {
    pub const OK: i32 = 0;
    pub const IO_ERROR: i32 = 1;
    pub const UNKNOWN_PRODUCT: i32 = 2;
    pub const CORRUPT_ARCHIVE: i32 = 3;
    pub const INVALID_PATH: i32 = 4;
    /// Files were written but the change could not be recorded
    pub const RECORD_FAILED: i32 = 5;
    pub const BAD_REQUEST: i32 = 6;
}

/// Frame header size: type + length
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted from a peer
pub const MAX_FRAME_LEN: u32 = 1 << 30;

/// Ask for the whole subtree of a product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub product: String,
    pub commit_ref: String,
}

/// Answer to a [`FetchRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    pub status: i32,
    pub message: String,
    pub archive: Bytes,
}

impl FetchReply {
    /// Successful reply carrying an archive
    #[must_use]
    pub fn ok(archive: Bytes) -> Self {
        Self {
            status: status::OK,
            message: String::new(),
            archive,
        }
    }

    /// Failed reply with no archive
    #[must_use]
    pub fn failed(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            archive: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

impl From<&Error> for FetchReply {
    fn from(err: &Error) -> Self {
        Self::failed(err.status_code(), err.to_string())
    }
}

/// Push a changeset into a product subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub product: String,
    pub commit_ref: String,
    /// Relative paths removed since the last push
    pub deleted: Vec<String>,
    /// Archive of new and modified files, possibly empty
    pub archive: Bytes,
}

/// Answer to an [`ApplyRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReply {
    pub status: i32,
    pub message: String,
}

impl ApplyReply {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: status::OK,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

impl From<&Error> for ApplyReply {
    fn from(err: &Error) -> Self {
        Self::failed(err.status_code(), err.to_string())
    }
}

/// Message received from protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FetchReq(FetchRequest),
    FetchResp(FetchReply),
    ApplyReq(ApplyRequest),
    ApplyResp(ApplyReply),
    /// Peer could not make sense of the previous frame
    Error(String),
}

impl Message {
    /// Wire type byte
    #[must_use]
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::FetchReq(_) => msg::FETCH_REQ,
            Self::FetchResp(_) => msg::FETCH_RESP,
            Self::ApplyReq(_) => msg::APPLY_REQ,
            Self::ApplyResp(_) => msg::APPLY_RESP,
            Self::Error(_) => msg::ERROR,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchReq(_) => "fetch request",
            Self::FetchResp(_) => "fetch response",
            Self::ApplyReq(_) => "apply request",
            Self::ApplyResp(_) => "apply response",
            Self::Error(_) => "error",
        }
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Protocol(format!("string of {} bytes is too long", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Protocol(format!("blob of {} bytes is too large", value.len())))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn encode_payload(message: &Message, buf: &mut BytesMut) -> Result<()> {
    match message {
        Message::FetchReq(req) => {
            put_str(buf, &req.product)?;
            put_str(buf, &req.commit_ref)?;
        }
        Message::FetchResp(reply) => {
            buf.put_i32(reply.status);
            put_str(buf, &reply.message)?;
            put_blob(buf, &reply.archive)?;
        }
        Message::ApplyReq(req) => {
            put_str(buf, &req.product)?;
            put_str(buf, &req.commit_ref)?;
            let count = u32::try_from(req.deleted.len())
                .map_err(|_| Error::Protocol("too many deleted paths".to_string()))?;
            buf.put_u32(count);
            for path in &req.deleted {
                put_str(buf, path)?;
            }
            put_blob(buf, &req.archive)?;
        }
        Message::ApplyResp(reply) => {
            buf.put_i32(reply.status);
            put_str(buf, &reply.message)?;
        }
        Message::Error(text) => buf.put_slice(text.as_bytes()),
    }
    Ok(())
}

/// Encode a message as one complete frame
///
/// # Errors
/// Returns [`Error::Protocol`] if a field does not fit its length prefix or
/// the frame exceeds [`MAX_FRAME_LEN`].
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
    buf.put_u8(message.msg_type());
    buf.put_u32(0);
    encode_payload(message, &mut buf)?;

    let payload_len = u32::try_from(buf.len() - HEADER_LEN)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Protocol(format!("frame of {} bytes is too large", buf.len())))?;
    buf[1..HEADER_LEN].copy_from_slice(&payload_len.to_be_bytes());
    Ok(buf.freeze())
}

/// Bounds-checked cursor over a frame payload
struct Payload {
    buf: Bytes,
}

impl Payload {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Protocol(format!(
                "payload truncated reading {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    fn string(&mut self, what: &str) -> Result<String> {
        self.need(2, what)?;
        let len = usize::from(self.buf.get_u16());
        self.need(len, what)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol(format!("{what} is not valid UTF-8")))
    }

    fn blob(&mut self, what: &str) -> Result<Bytes> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    fn finish(self, what: &str) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {what}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Decode the payload of a frame whose header has already been read
///
/// # Errors
/// Returns [`Error::Protocol`] for unknown types and malformed payloads.
pub fn decode_payload(msg_type: u8, payload: Bytes) -> Result<Message> {
    let mut p = Payload { buf: payload };

    let message = match msg_type {
        msg::FETCH_REQ => Message::FetchReq(FetchRequest {
            product: p.string("product")?,
            commit_ref: p.string("commit ref")?,
        }),

        msg::FETCH_RESP => Message::FetchResp(FetchReply {
            status: p.i32("status")?,
            message: p.string("message")?,
            archive: p.blob("archive")?,
        }),

        msg::APPLY_REQ => {
            let product = p.string("product")?;
            let commit_ref = p.string("commit ref")?;
            let count = p.u32("deleted count")? as usize;
            // Every path costs at least its 2-byte prefix
            p.need(count.saturating_mul(2), "deleted paths")?;
            let mut deleted = Vec::with_capacity(count);
            for _ in 0..count {
                deleted.push(p.string("deleted path")?);
            }
            Message::ApplyReq(ApplyRequest {
                product,
                commit_ref,
                deleted,
                archive: p.blob("archive")?,
            })
        }

        msg::APPLY_RESP => Message::ApplyResp(ApplyReply {
            status: p.i32("status")?,
            message: p.string("message")?,
        }),

        msg::ERROR => {
            let text = String::from_utf8_lossy(&p.buf).to_string();
            p.buf.clear();
            Message::Error(text)
        }

        other => return Err(Error::Protocol(format!("unknown message type: {other:#04x}"))),
    };

    p.finish(message.name())?;
    Ok(message)
}

/// Decode exactly one complete frame
///
/// # Errors
/// Returns [`Error::Protocol`] if the frame is truncated, oversized, has
/// trailing bytes or carries a malformed payload.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame truncated: {} of {HEADER_LEN} header bytes",
            frame.len()
        )));
    }
    let msg_type = frame[0];
    let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    check_len(len)?;

    let payload = &frame[HEADER_LEN..];
    if payload.len() != len as usize {
        return Err(Error::Protocol(format!(
            "frame length {len} does not match {} payload bytes",
            payload.len()
        )));
    }
    decode_payload(msg_type, Bytes::copy_from_slice(payload))
}

fn check_len(len: u32) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and flush one message
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] if the message cannot be encoded, or
    /// [`Error::Stream`] if the connection fails.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let frame = encode_message(message)?;
        self.inner.write_all(&frame).await.map_err(Error::Stream)?;
        self.inner.flush().await.map_err(Error::Stream)?;
        Ok(())
    }

    /// Send error response
    ///
    /// # Errors
    /// See [`ProtocolWriter::send`].
    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        self.send(&Message::Error(message.to_string())).await
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message, or `None` if the peer closed between frames
    ///
    /// # Errors
    /// Returns [`Error::Stream`] if the connection fails or closes mid-frame,
    /// and [`Error::Protocol`] for malformed frames.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; HEADER_LEN];
        let first = self.inner.read(&mut header[..1]).await.map_err(Error::Stream)?;
        if first == 0 {
            return Ok(None);
        }
        self.inner
            .read_exact(&mut header[1..])
            .await
            .map_err(Error::Stream)?;

        let msg_type = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        check_len(len)?;

        // Grows with the bytes that actually arrive, not the claimed length
        let mut payload = Vec::new();
        let received = (&mut self.inner)
            .take(u64::from(len))
            .read_to_end(&mut payload)
            .await
            .map_err(Error::Stream)?;
        if received < len as usize {
            return Err(Error::Stream(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }

        decode_payload(msg_type, Bytes::from(payload)).map(Some)
    }

    /// Read next message, treating a closed connection as an error
    ///
    /// # Errors
    /// See [`ProtocolReader::next_message`].
    pub async fn read_message(&mut self) -> Result<Message> {
        self.next_message().await?.ok_or_else(|| {
            Error::Stream(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
        })
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}
