//! Endianness-aware frame codec over any `Read`/`Write` byte stream.
//!
//! Each frame is `[u32 len][u8 kind][u32 seq][i32 id][body]`, with every
//! multi-byte integer in the *sender's* native byte order. A one-shot hello
//! exchange at connection setup lets each receiver detect whether the peer's
//! order differs; decoding then swaps numerics as needed. The body is a flat
//! list of `[i32 key][u8 tag][payload]` entries, recursing for sub-messages.
//!
//! Byte blobs travel byte-exact in both directions; floats travel as their
//! IEEE-754 bit patterns.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use crate::message::{Message, OwnedMessage, Value};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Maximum sub-message nesting depth accepted on either side.
pub const MAX_NESTING: usize = 64;

/// Wire protocol version, bumped on breaking format changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hello magic. Written in native byte order so the peer can tell a
/// byte-swapped stream from a corrupt one.
const MAGIC: u32 = 0x5041_5443;

/// Value tags on the wire.
mod tag {
    pub const INT32: u8 = 1;
    pub const INT64: u8 = 2;
    pub const SIZE: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const STRING: u8 = 6;
    pub const BYTES: u8 = 7;
    pub const SUB: u8 = 8;
}

/// Byte order of the peer relative to ours, fixed once per connection by
/// the hello exchange. Failing to establish this is a configuration error
/// checked at setup, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Peer has our byte order; numerics pass through untouched.
    Native,
    /// Peer is byte-swapped relative to us; numerics are corrected on decode.
    Swapped,
}

impl ByteOrder {
    /// Decodes a `u32` read off the wire.
    fn u32(self, raw: [u8; 4]) -> u32 {
        let v = u32::from_ne_bytes(raw);
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }

    /// Decodes an `i32` read off the wire.
    fn i32(self, raw: [u8; 4]) -> i32 {
        let v = i32::from_ne_bytes(raw);
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }

    /// Decodes a `u64` read off the wire.
    fn u64(self, raw: [u8; 8]) -> u64 {
        let v = u64::from_ne_bytes(raw);
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }

    /// Decodes an `i64` read off the wire.
    fn i64(self, raw: [u8; 8]) -> i64 {
        let v = i64::from_ne_bytes(raw);
        match self {
            Self::Native => v,
            Self::Swapped => v.swap_bytes(),
        }
    }
}

/// Errors crossing the wire layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    /// An I/O error from the underlying byte pipe.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A frame exceeded the size limit; nothing was transmitted.
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    /// The peer did not open with the expected hello magic.
    #[error("handshake magic mismatch (got {0:#010x})")]
    BadMagic(u32),

    /// The peer speaks an incompatible protocol revision.
    #[error("peer speaks protocol v{peer}, this side v{ours}")]
    VersionMismatch {
        /// Version byte received from the peer.
        peer: u8,
        /// Our own protocol version.
        ours: u8,
    },

    /// A frame carried an unknown frame kind or value tag.
    #[error("unknown wire tag {0}")]
    BadTag(u8),

    /// A string value was not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),

    /// A frame ended before its declared content did.
    #[error("frame truncated")]
    Truncated,

    /// A frame carried bytes past its declared content.
    #[error("{0} trailing bytes after frame content")]
    TrailingBytes(usize),

    /// A frame repeated a key within one message.
    #[error("duplicate key {0} in received message")]
    DuplicateKey(i32),

    /// Sub-messages nested beyond [`MAX_NESTING`].
    #[error("sub-messages nested deeper than {MAX_NESTING} levels")]
    NestingTooDeep,
}

/// Distinguishes requests from their acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// An operation request; the peer owes a reply frame.
    Call,
    /// The reply unblocking one outstanding call.
    Reply,
}

impl FrameKind {
    /// Wire byte for this kind.
    const fn wire_byte(self) -> u8 {
        match self {
            Self::Call => 1,
            Self::Reply => 2,
        }
    }
}

/// One transmissible unit: routing header plus message body.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Call or reply.
    pub kind: FrameKind,
    /// Correlation number pairing a reply with its blocked caller.
    pub seq: u32,
    /// Operation ID for calls; `0` for replies.
    pub id: i32,
    /// The typed key/value payload.
    pub body: Message<'a>,
}

/// A frame decoded off the wire, owning all of its memory.
pub type OwnedFrame = Frame<'static>;

/// Writes our hello: magic in native byte order plus the protocol version.
pub fn write_hello(w: &mut (impl Write + ?Sized)) -> Result<(), WireError> {
    w.write_all(&MAGIC.to_ne_bytes())?;
    w.write_all(&[PROTOCOL_VERSION])?;
    w.flush()?;
    Ok(())
}

/// Reads the peer's hello and determines its byte order relative to ours.
pub fn read_hello(r: &mut (impl Read + ?Sized)) -> Result<ByteOrder, WireError> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    let got = u32::from_ne_bytes(raw);
    let order = if got == MAGIC {
        ByteOrder::Native
    } else if got.swap_bytes() == MAGIC {
        ByteOrder::Swapped
    } else {
        return Err(WireError::BadMagic(got));
    };

    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            peer: version[0],
            ours: PROTOCOL_VERSION,
        });
    }
    Ok(order)
}

/// Encodes `frame` as a length-prefixed unit and writes it to `w`.
///
/// The frame is fully serialized and size-checked before the first byte
/// touches the stream, so a rejected frame transmits nothing.
pub fn write_frame(w: &mut (impl Write + ?Sized), frame: &Frame<'_>) -> Result<(), WireError> {
    let mut payload = Vec::with_capacity(64);
    payload.push(frame.kind.wire_byte());
    payload.extend_from_slice(&frame.seq.to_ne_bytes());
    payload.extend_from_slice(&frame.id.to_ne_bytes());
    encode_body(&mut payload, &frame.body, 0)?;

    let Ok(len) = u32::try_from(payload.len()) else {
        return Err(WireError::FrameTooLarge(payload.len()));
    };
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    w.write_all(&len.to_ne_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame from `r`, correcting byte order per the hello exchange.
pub fn read_frame(
    r: &mut (impl Read + ?Sized),
    order: ByteOrder,
) -> Result<OwnedFrame, WireError> {
    read_frame_limited(r, order, MAX_FRAME)
}

/// [`read_frame`] with a connection-specific payload bound (capped at
/// [`MAX_FRAME`]).
pub fn read_frame_limited(
    r: &mut (impl Read + ?Sized),
    order: ByteOrder,
    max_len: u32,
) -> Result<OwnedFrame, WireError> {
    let limit = max_len.min(MAX_FRAME);
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = order.u32(len_buf);
    if len > limit {
        return Err(WireError::FrameTooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;

    let mut cur = Cursor::new(&payload, order);
    let kind = match cur.u8()? {
        1 => FrameKind::Call,
        2 => FrameKind::Reply,
        t => return Err(WireError::BadTag(t)),
    };
    let seq = cur.u32()?;
    let id = cur.i32()?;
    let body = decode_body(&mut cur, 0)?;
    let rest = cur.remaining();
    if rest != 0 {
        return Err(WireError::TrailingBytes(rest));
    }
    Ok(Frame {
        kind,
        seq,
        id,
        body,
    })
}

/// Appends a message body (entry count then entries) to `out`.
fn encode_body(out: &mut Vec<u8>, msg: &Message<'_>, depth: usize) -> Result<(), WireError> {
    if depth > MAX_NESTING {
        return Err(WireError::NestingTooDeep);
    }
    let Ok(count) = u32::try_from(msg.len()) else {
        return Err(WireError::FrameTooLarge(msg.len()));
    };
    out.extend_from_slice(&count.to_ne_bytes());
    for (key, value) in msg.iter() {
        out.extend_from_slice(&key.to_ne_bytes());
        match value {
            Value::Int32(v) => {
                out.push(tag::INT32);
                out.extend_from_slice(&v.to_ne_bytes());
            }
            Value::Int64(v) => {
                out.push(tag::INT64);
                out.extend_from_slice(&v.to_ne_bytes());
            }
            Value::Size(v) => {
                out.push(tag::SIZE);
                out.extend_from_slice(&v.to_ne_bytes());
            }
            Value::Float(v) => {
                out.push(tag::FLOAT);
                out.extend_from_slice(&v.to_bits().to_ne_bytes());
            }
            Value::Double(v) => {
                out.push(tag::DOUBLE);
                out.extend_from_slice(&v.to_bits().to_ne_bytes());
            }
            Value::String(s) => {
                out.push(tag::STRING);
                let Ok(len) = u32::try_from(s.len()) else {
                    return Err(WireError::FrameTooLarge(s.len()));
                };
                out.extend_from_slice(&len.to_ne_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(tag::BYTES);
                out.extend_from_slice(&(b.len() as u64).to_ne_bytes());
                out.extend_from_slice(b);
            }
            Value::Sub(sub) => {
                out.push(tag::SUB);
                encode_body(out, sub, depth + 1)?;
            }
        }
    }
    Ok(())
}

/// Decodes a message body from the cursor into an owned message.
fn decode_body(cur: &mut Cursor<'_>, depth: usize) -> Result<OwnedMessage, WireError> {
    if depth > MAX_NESTING {
        return Err(WireError::NestingTooDeep);
    }
    let count = cur.u32()?;
    let mut msg = Message::new();
    for _ in 0..count {
        let key = cur.i32()?;
        if msg.contains_key(key) {
            return Err(WireError::DuplicateKey(key));
        }
        let value = match cur.u8()? {
            tag::INT32 => Value::Int32(cur.i32()?),
            tag::INT64 => Value::Int64(cur.i64()?),
            tag::SIZE => Value::Size(cur.u64()?),
            tag::FLOAT => Value::Float(f32::from_bits(cur.u32()?)),
            tag::DOUBLE => Value::Double(f64::from_bits(cur.u64()?)),
            tag::STRING => {
                let len = cur.u32()? as usize;
                let bytes = cur.take(len)?.to_vec();
                Value::String(Cow::Owned(String::from_utf8(bytes)?))
            }
            tag::BYTES => {
                let len = usize::try_from(cur.u64()?).map_err(|_| WireError::Truncated)?;
                Value::Bytes(Cow::Owned(cur.take(len)?.to_vec()))
            }
            tag::SUB => Value::Sub(decode_body(cur, depth + 1)?),
            t => return Err(WireError::BadTag(t)),
        };
        // Duplicate was checked above; insert cannot fail.
        let _ = msg.insert(key, value);
    }
    Ok(msg)
}

/// Bounds-checked reader over one frame payload, applying byte-order
/// correction as it goes.
struct Cursor<'b> {
    /// Unconsumed payload bytes.
    buf: &'b [u8],
    /// Correction to apply to multi-byte integers.
    order: ByteOrder,
}

impl<'b> Cursor<'b> {
    /// Starts a cursor at the beginning of `buf`.
    const fn new(buf: &'b [u8], order: ByteOrder) -> Self {
        Self { buf, order }
    }

    /// Bytes left unconsumed.
    fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Consumes exactly `n` bytes.
    fn take(&mut self, n: usize) -> Result<&'b [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    /// Consumes one byte.
    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Consumes a `u32`, corrected for byte order.
    fn u32(&mut self) -> Result<u32, WireError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(self.order.u32(raw))
    }

    /// Consumes an `i32`, corrected for byte order.
    fn i32(&mut self) -> Result<i32, WireError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(self.order.i32(raw))
    }

    /// Consumes a `u64`, corrected for byte order.
    fn u64(&mut self) -> Result<u64, WireError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(self.order.u64(raw))
    }

    /// Consumes an `i64`, corrected for byte order.
    fn i64(&mut self) -> Result<i64, WireError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(self.order.i64(raw))
    }
}
