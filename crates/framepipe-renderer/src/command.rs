//! Command-buffer envelope.
//!
//! A batch is a sequence of operations, each framed as:
//!
//! ```text
//! ┌──────────────┬────────────┬─────────────┬──────────────────┐
//! │ Opcode (2B)  │ Flags (2B) │ Length (4B) │ Payload          │
//! │ LE           │ LE         │ LE          │ (Length bytes)   │
//! └──────────────┴────────────┴─────────────┴──────────────────┘
//! ```
//!
//! Decoding is best-effort: an operation with an unknown opcode or a payload
//! of the wrong size is skipped and decoding resumes at the next header. A
//! header or payload that runs past the end of the buffer ends the batch.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Operation header: opcode (2) + flags (2) + length (4) = 8 bytes.
pub const OP_HEADER_SIZE: usize = 8;

/// Known operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Nop = 0x0000,
    Clear = 0x0001,
    FillRect = 0x0002,
    Flush = 0x0003,
    /// Opaque payload for the translation library.
    GlesStream = 0x0010,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Nop),
            0x0001 => Some(Self::Clear),
            0x0002 => Some(Self::FillRect),
            0x0003 => Some(Self::Flush),
            0x0010 => Some(Self::GlesStream),
            _ => None,
        }
    }

    /// Required payload length, `None` when any length is accepted.
    pub fn payload_len(self) -> Option<usize> {
        match self {
            Self::Nop | Self::Flush => Some(0),
            Self::Clear => Some(4),
            Self::FillRect => Some(20),
            Self::GlesStream => None,
        }
    }
}

/// One decoded operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Nop,
    /// Fill the surface with a packed `0xAARRGGBB` colour.
    Clear { color: u32 },
    FillRect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        color: u32,
    },
    Flush,
    GlesStream(Bytes),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Nop => Opcode::Nop,
            Self::Clear { .. } => Opcode::Clear,
            Self::FillRect { .. } => Opcode::FillRect,
            Self::Flush => Opcode::Flush,
            Self::GlesStream(_) => Opcode::GlesStream,
        }
    }

    /// Append the payload bytes (without header) to `dst`.
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Self::Nop | Self::Flush => {}
            Self::Clear { color } => dst.put_u32_le(*color),
            Self::FillRect {
                x,
                y,
                width,
                height,
                color,
            } => {
                dst.put_u32_le(*x);
                dst.put_u32_le(*y);
                dst.put_u32_le(*width);
                dst.put_u32_le(*height);
                dst.put_u32_le(*color);
            }
            Self::GlesStream(data) => dst.put_slice(data),
        }
    }

    fn decode(opcode: Opcode, mut payload: Bytes) -> Self {
        match opcode {
            Opcode::Nop => Self::Nop,
            Opcode::Flush => Self::Flush,
            Opcode::Clear => Self::Clear {
                color: payload.get_u32_le(),
            },
            Opcode::FillRect => Self::FillRect {
                x: payload.get_u32_le(),
                y: payload.get_u32_le(),
                width: payload.get_u32_le(),
                height: payload.get_u32_le(),
                color: payload.get_u32_le(),
            },
            Opcode::GlesStream => Self::GlesStream(payload),
        }
    }
}

/// An operation the decoder could not accept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Skipped {
    UnknownOpcode { offset: usize, opcode: u16 },
    BadLength { offset: usize, opcode: Opcode, len: usize },
    /// Header or payload ran past the end of the buffer.
    Truncated { offset: usize, remaining: usize },
}

impl std::fmt::Display for Skipped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpcode { offset, opcode } => {
                write!(f, "unknown opcode {opcode:#06x} at offset {offset}")
            }
            Self::BadLength {
                offset,
                opcode,
                len,
            } => write!(f, "{opcode:?} with {len}-byte payload at offset {offset}"),
            Self::Truncated { offset, remaining } => {
                write!(f, "truncated operation at offset {offset} ({remaining} bytes left)")
            }
        }
    }
}

/// Result of decoding one command buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub commands: Vec<Command>,
    pub skipped: Vec<Skipped>,
}

/// Decode a command buffer, skipping operations that cannot be accepted.
pub fn decode(buffer: &[u8]) -> Batch {
    let mut batch = Batch::default();
    let mut src = Bytes::copy_from_slice(buffer);
    let total = src.len();

    while src.has_remaining() {
        let offset = total - src.remaining();
        if src.remaining() < OP_HEADER_SIZE {
            batch.skipped.push(Skipped::Truncated {
                offset,
                remaining: src.remaining(),
            });
            break;
        }

        let raw_opcode = src.get_u16_le();
        let _flags = src.get_u16_le();
        let len = src.get_u32_le() as usize;
        if len > src.remaining() {
            batch.skipped.push(Skipped::Truncated {
                offset,
                remaining: src.remaining() + OP_HEADER_SIZE,
            });
            break;
        }
        let payload = src.split_to(len);

        let Some(opcode) = Opcode::from_u16(raw_opcode) else {
            batch.skipped.push(Skipped::UnknownOpcode {
                offset,
                opcode: raw_opcode,
            });
            continue;
        };
        if opcode.payload_len().is_some_and(|expected| expected != len) {
            batch.skipped.push(Skipped::BadLength { offset, opcode, len });
            continue;
        }
        batch.commands.push(Command::decode(opcode, payload));
    }

    batch
}

/// Append one framed operation with an arbitrary opcode and payload.
pub fn encode_raw(opcode: u16, flags: u16, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(OP_HEADER_SIZE + payload.len());
    dst.put_u16_le(opcode);
    dst.put_u16_le(flags);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
}

/// Append one framed command.
pub fn encode(command: &Command, dst: &mut BytesMut) {
    let mut payload = BytesMut::new();
    command.encode_payload(&mut payload);
    encode_raw(command.opcode() as u16, 0, &payload, dst);
}

/// Encode a whole batch.
pub fn encode_batch(commands: &[Command]) -> Bytes {
    let mut dst = BytesMut::new();
    for command in commands {
        encode(command, &mut dst);
    }
    dst.freeze()
}
