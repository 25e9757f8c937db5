//! The typed key/value message model — the wire unit of the bridge.

use std::borrow::Cow;
use std::fmt;

use crate::encode::EncodeError;

/// Key identifying one value slot within a [`Message`].
///
/// Negative keys are reserved for the protocol itself (routing metadata,
/// error markers); application payload uses keys `>= 0`.
pub type MessageKey = i32;

/// Reserved key carrying the dispatch target's [`InstanceRef`] as a
/// [`Value::Size`].
pub const KEY_INSTANCE_REF: MessageKey = -1;

/// Reserved key marking a reply as a failed dispatch. Carries a
/// human-readable failure description as a [`Value::String`].
pub const KEY_ERROR: MessageKey = -2;

/// Lowest valid operation ID.
pub const MESSAGE_ID_RANGE_START: i32 = 1;

/// One past the highest valid operation ID.
pub const MESSAGE_ID_RANGE_END: i32 = 8 * 16 * 16 - 1;

/// Identifies which operation an outgoing message requests.
///
/// Valid IDs live in the window `MESSAGE_ID_RANGE_START..MESSAGE_ID_RANGE_END`
/// so the low bits can double as a dispatch table index on the receiving
/// side. Values outside the window are rejected before anything is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(i32);

impl MessageId {
    /// Creates an operation ID, rejecting values outside the valid window.
    pub const fn new(raw: i32) -> Result<Self, EncodeError> {
        if raw >= MESSAGE_ID_RANGE_START && raw < MESSAGE_ID_RANGE_END {
            Ok(Self(raw))
        } else {
            Err(EncodeError::InvalidMessageId(raw))
        }
    }

    /// Returns the numeric ID.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Opaque cross-process handle to an object owned by the peer.
///
/// Minted by the side that owns the real object; the other side stores and
/// forwards it but never interprets it. It is only ever a lookup key into
/// the owning side's registry — a stale ref after teardown is a protocol
/// error, not a memory-safety hazard, because nothing dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceRef(u64);

impl InstanceRef {
    /// Wraps a raw handle received from the owning side.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle for transport.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// One tagged value slot within a [`Message`].
///
/// There is no implicit coercion between variants: a value appended as one
/// type reads back only through the matching typed accessor.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value<'a> {
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// Pointer-width value, normalized to 64 bits on the wire. Also used
    /// to transport host refs across the boundary as plain integers.
    Size(u64),
    /// 32-bit IEEE-754 float.
    Float(f32),
    /// 64-bit IEEE-754 double.
    Double(f64),
    /// UTF-8 text, free of interior NUL bytes.
    String(Cow<'a, str>),
    /// Raw byte blob; borrowed when appended through the no-copy path.
    Bytes(Cow<'a, [u8]>),
    /// Nested sub-message encoding a compound value.
    Sub(Message<'a>),
}

/// An ordered collection of typed, keyed values — one logical wire unit.
///
/// A message holds at most one value per key; appending a duplicate key is
/// an error at build time. Insertion order is irrelevant for lookup but
/// preserved for iteration and debugging. Keys are only unique within one
/// message (nested sub-messages have their own key space).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message<'a> {
    /// Entries in insertion order.
    entries: Vec<(MessageKey, Value<'a>)>,
}

/// A message whose values own all their memory, e.g. one decoded off the
/// wire.
pub type OwnedMessage = Message<'static>;

impl<'a> Message<'a> {
    /// Creates an empty message.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns `true` if the message holds no key/value pairs.
    ///
    /// Mainly useful for debugging and validation: a logically empty reply
    /// is how "void" calls acknowledge completion.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Answers presence for a key without decoding its value.
    pub fn contains_key(&self, key: MessageKey) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: MessageKey) -> Option<&Value<'a>> {
        self.entries
            .iter()
            .find_map(|(k, v)| (*k == key).then_some(v))
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (MessageKey, &Value<'a>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Creates a read-only decoder view over this message.
    pub fn decoder(&self) -> crate::decode::MessageDecoder<'_> {
        crate::decode::MessageDecoder::over(self)
    }

    /// Stores `value` under `key`, rejecting duplicate keys.
    pub(crate) fn insert(
        &mut self,
        key: MessageKey,
        value: Value<'a>,
    ) -> Result<(), EncodeError> {
        if self.contains_key(key) {
            return Err(EncodeError::DuplicateKey(key));
        }
        self.entries.push((key, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_window() {
        assert!(MessageId::new(MESSAGE_ID_RANGE_START).is_ok());
        assert!(MessageId::new(42).is_ok());
        assert!(MessageId::new(MESSAGE_ID_RANGE_END - 1).is_ok());

        assert!(MessageId::new(0).is_err());
        assert!(MessageId::new(-1).is_err());
        assert!(MessageId::new(MESSAGE_ID_RANGE_END).is_err());
        assert!(MessageId::new(i32::MAX).is_err());
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut msg = Message::new();
        msg.insert(3, Value::Int32(1)).unwrap();
        let err = msg.insert(3, Value::Int32(2)).unwrap_err();
        assert!(matches!(err, EncodeError::DuplicateKey(3)));
        // The original value is untouched.
        assert_eq!(msg.get(3), Some(&Value::Int32(1)));
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn insertion_order_preserved() {
        let mut msg = Message::new();
        msg.insert(5, Value::Int32(0)).unwrap();
        msg.insert(-1, Value::Size(7)).unwrap();
        msg.insert(2, Value::Int64(9)).unwrap();
        let keys: Vec<MessageKey> = msg.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![5, -1, 2]);
    }

    #[test]
    fn reserved_keys_do_not_collide_with_payload() {
        let mut msg = Message::new();
        msg.insert(KEY_INSTANCE_REF, Value::Size(1)).unwrap();
        msg.insert(1, Value::Size(2)).unwrap();
        assert_eq!(msg.get(KEY_INSTANCE_REF), Some(&Value::Size(1)));
        assert_eq!(msg.get(1), Some(&Value::Size(2)));
    }

    #[test]
    fn instance_ref_round_trips_raw() {
        let r = InstanceRef::from_raw(u64::MAX);
        assert_eq!(r.raw(), u64::MAX);
        assert_eq!(format!("{}", InstanceRef::from_raw(9)), "ref#9");
    }
}
