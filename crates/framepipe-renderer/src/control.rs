//! Worker control protocol.
//!
//! A parent drives a renderer worker over the child's stdin/stdout with
//! length-prefixed messages:
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────────┐
//! │ Tag (1B) │ Length (4B) │ Payload          │
//! │          │ LE          │ (Length bytes)   │
//! └──────────┴─────────────┴──────────────────┘
//! ```
//!
//! Requests carry a [`RequestKind`] tag, responses a [`Status`] tag. Every
//! request gets exactly one response.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::RendererConfig;

/// Message header: tag (1) + length (4) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Default maximum payload size: 64 MiB, enough for a 4K RGBA command batch.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Errors on the control stream.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The tag byte names no known request or status.
    #[error("unknown control tag {0:#04x}")]
    UnknownTag(u8),

    /// The payload does not fit the message type.
    #[error("malformed control payload: {0}")]
    Malformed(String),

    #[error("control payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("control JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("control stream closed")]
    ConnectionClosed,
}

impl ControlError {
    /// True when the stream is still aligned on a message boundary and the
    /// conversation can continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownTag(_) | Self::Malformed(_) | Self::Json(_))
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Request tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Init = 0x01,
    ProcessCommands = 0x02,
    Info = 0x03,
    Resize = 0x04,
    Rotate = 0x05,
    Shutdown = 0xFF,
}

impl RequestKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::ProcessCommands),
            0x03 => Some(Self::Info),
            0x04 => Some(Self::Resize),
            0x05 => Some(Self::Rotate),
            0xFF => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Response tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Rejected without changing renderer state.
    Error = 1,
    /// The renderer moved into `Error`.
    Fatal = 2,
}

impl Status {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// A decoded request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Payload: [`RendererConfig`] as JSON.
    Init(RendererConfig),
    /// Payload: the raw command buffer.
    ProcessCommands(Bytes),
    Info,
    /// Payload: width u32 LE, height u32 LE.
    Resize { width: u32, height: u32 },
    /// Payload: degrees u32 LE.
    Rotate(u32),
    Shutdown,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Init(_) => RequestKind::Init,
            Self::ProcessCommands(_) => RequestKind::ProcessCommands,
            Self::Info => RequestKind::Info,
            Self::Resize { .. } => RequestKind::Resize,
            Self::Rotate(_) => RequestKind::Rotate,
            Self::Shutdown => RequestKind::Shutdown,
        }
    }

    fn payload(&self) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        match self {
            Self::Init(config) => return Ok(serde_json::to_vec(config)?.into()),
            Self::ProcessCommands(buffer) => return Ok(buffer.clone()),
            Self::Info | Self::Shutdown => {}
            Self::Resize { width, height } => {
                dst.put_u32_le(*width);
                dst.put_u32_le(*height);
            }
            Self::Rotate(degrees) => dst.put_u32_le(*degrees),
        }
        Ok(dst.freeze())
    }

    fn decode(message: Message) -> Result<Self> {
        let kind = RequestKind::from_u8(message.tag).ok_or(ControlError::UnknownTag(message.tag))?;
        let mut payload = message.payload;
        let request = match kind {
            RequestKind::Init => Self::Init(serde_json::from_slice(&payload)?),
            RequestKind::ProcessCommands => Self::ProcessCommands(payload),
            RequestKind::Info => Self::Info,
            RequestKind::Shutdown => Self::Shutdown,
            RequestKind::Resize => {
                expect_len(&payload, 8, "RESIZE")?;
                Self::Resize {
                    width: payload.get_u32_le(),
                    height: payload.get_u32_le(),
                }
            }
            RequestKind::Rotate => {
                expect_len(&payload, 4, "ROTATE")?;
                Self::Rotate(payload.get_u32_le())
            }
        };
        Ok(request)
    }
}

fn expect_len(payload: &Bytes, expected: usize, what: &str) -> Result<()> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(ControlError::Malformed(format!(
            "{what} payload is {} bytes, expected {expected}",
            payload.len()
        )))
    }
}

/// A response: status plus JSON (on `Ok`) or a UTF-8 message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Bytes,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            payload: Bytes::new(),
        }
    }

    pub fn ok_json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: Status::Ok,
            payload: serde_json::to_vec(value)?.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: Bytes::from(message.into()),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            status: Status::Fatal,
            payload: Bytes::from(message.into()),
        }
    }

    /// Payload as text, for `Error` and `Fatal` responses.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    fn decode(message: Message) -> Result<Self> {
        let status = Status::from_u8(message.tag).ok_or(ControlError::UnknownTag(message.tag))?;
        Ok(Self {
            status,
            payload: message.payload,
        })
    }
}

/// One framed message before interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

/// Append one framed message to `dst`.
pub fn encode_message(tag: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(ControlError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(tag);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Take one complete message off the front of `src`.
///
/// Returns `Ok(None)` until a whole message is buffered.
pub fn decode_message(src: &mut BytesMut, max_payload: usize) -> Result<Option<Message>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    let tag = src[0];
    let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
    if len > max_payload {
        return Err(ControlError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    if src.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    src.advance(HEADER_SIZE);
    let payload = src.split_to(len).freeze();
    Ok(Some(Message { tag, payload }))
}

/// Reads complete control messages from any `Read` stream.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Read> MessageReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// EOF at a message boundary, or inside a message, is
    /// [`ControlError::ConnectionClosed`].
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = decode_message(&mut self.buf, self.max_payload)? {
                return Ok(message);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ControlError::Io(err)),
            };
            if read == 0 {
                return Err(ControlError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn read_request(&mut self) -> Result<Request> {
        Request::decode(self.read_message()?)
    }

    pub fn read_response(&mut self) -> Result<Response> {
        Response::decode(self.read_message()?)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Writes complete control messages to any `Write` stream.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> MessageWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Write and flush one message.
    pub fn write_message(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_message(tag, payload, &mut self.buf)?;

        match self.inner.write_all(&self.buf) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                return Err(ControlError::ConnectionClosed)
            }
            Err(err) => return Err(ControlError::Io(err)),
        }
        self.inner.flush().map_err(ControlError::Io)
    }

    pub fn write_request(&mut self, request: &Request) -> Result<()> {
        let payload = request.payload()?;
        self.write_message(request.kind() as u8, &payload)
    }

    pub fn write_response(&mut self, response: &Response) -> Result<()> {
        self.write_message(response.status as u8, &response.payload)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wire(requests: &[Request]) -> Vec<u8> {
        let mut writer = MessageWriter::new(Vec::new());
        for request in requests {
            writer.write_request(request).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn requests_survive_the_wire() {
        let requests = [
            Request::Init(RendererConfig::stub(32, 16)),
            Request::ProcessCommands(Bytes::from_static(&[0u8; 8])),
            Request::Resize {
                width: 540,
                height: 960,
            },
            Request::Rotate(270),
            Request::Info,
            Request::Shutdown,
        ];
        let mut reader = MessageReader::new(Cursor::new(wire(&requests)));
        for expected in &requests {
            assert_eq!(&reader.read_request().unwrap(), expected);
        }
        assert!(matches!(
            reader.read_request(),
            Err(ControlError::ConnectionClosed)
        ));
    }

    #[test]
    fn resize_header_layout() {
        let bytes = wire(&[Request::Resize {
            width: 2,
            height: 3,
        }]);
        assert_eq!(bytes, [0x04, 8, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn unknown_tag_keeps_stream_aligned() {
        let mut bytes = Vec::new();
        let mut buf = BytesMut::new();
        encode_message(0x42, b"??", &mut buf).unwrap();
        bytes.extend_from_slice(&buf);
        bytes.extend_from_slice(&wire(&[Request::Info]));

        let mut reader = MessageReader::new(Cursor::new(bytes));
        let err = reader.read_request().unwrap_err();
        assert!(matches!(err, ControlError::UnknownTag(0x42)));
        assert!(err.is_recoverable());
        assert_eq!(reader.read_request().unwrap(), Request::Info);
    }

    #[test]
    fn short_rotate_payload_is_malformed() {
        let mut buf = BytesMut::new();
        encode_message(RequestKind::Rotate as u8, &[90, 0], &mut buf).unwrap();
        let mut reader = MessageReader::new(Cursor::new(buf.to_vec()));
        assert!(matches!(
            reader.read_request(),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_message_is_connection_closed() {
        let mut bytes = wire(&[Request::Rotate(90)]);
        bytes.truncate(HEADER_SIZE + 2);
        let mut reader = MessageReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_request(),
            Err(ControlError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = BytesMut::new();
        encode_message(0x02, &[0u8; 32], &mut buf).unwrap();
        let mut reader = MessageReader::with_max_payload(Cursor::new(buf.to_vec()), 16);
        assert!(matches!(
            reader.read_request(),
            Err(ControlError::PayloadTooLarge { size: 32, max: 16 })
        ));
    }

    #[test]
    fn responses_carry_status_and_message() {
        let mut writer = MessageWriter::new(Vec::new());
        writer.write_response(&Response::ok()).unwrap();
        writer
            .write_response(&Response::fatal("context lost"))
            .unwrap();

        let mut reader = MessageReader::new(Cursor::new(writer.into_inner()));
        assert_eq!(reader.read_response().unwrap().status, Status::Ok);
        let fatal = reader.read_response().unwrap();
        assert_eq!(fatal.status, Status::Fatal);
        assert_eq!(fatal.message(), "context lost");
    }
}
