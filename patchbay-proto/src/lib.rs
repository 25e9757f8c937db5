//! Wire layer of the patchbay cross-process call bridge.
//!
//! A [`Message`] is a self-describing, ordered collection of typed, keyed
//! values — optionally nesting sub-messages — built through a
//! [`MessageEncoder`] and read back through a [`MessageDecoder`]. Frames
//! wrap messages with a call/reply header and a correlation number, framed
//! with a length prefix suitable for any reliable byte stream (Unix socket,
//! TCP, pipe).
//!
//! All numerics travel in the sender's native byte order; a one-shot hello
//! exchange ([`write_hello`]/[`read_hello`]) detects a byte-swapped peer so
//! receivers can correct transparently.

mod codec;
mod decode;
mod encode;
mod message;

pub use codec::{
    read_frame, read_frame_limited, read_hello, write_frame, write_hello, ByteOrder, Frame,
    FrameKind, OwnedFrame, WireError, MAX_FRAME, MAX_NESTING, PROTOCOL_VERSION,
};
pub use decode::MessageDecoder;
pub use encode::{EncodeError, MessageEncoder};
pub use message::{
    InstanceRef, Message, MessageId, MessageKey, OwnedMessage, Value, KEY_ERROR,
    KEY_INSTANCE_REF, MESSAGE_ID_RANGE_END, MESSAGE_ID_RANGE_START,
};
