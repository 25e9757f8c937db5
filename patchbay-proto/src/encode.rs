//! Append-only builder for outgoing messages.

use std::borrow::Cow;

use crate::message::{Message, MessageKey, Value};

/// Errors reported while a message is being built, before anything is
/// handed to the transport. A rejected append leaves the message unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// Operation ID outside the valid window.
    #[error("operation ID {0} outside the valid window")]
    InvalidMessageId(i32),

    /// The key is already present in this message.
    #[error("duplicate key {0} in message")]
    DuplicateKey(MessageKey),

    /// String values must be NUL-free UTF-8.
    #[error("interior NUL byte in string value for key {0}")]
    NulInString(MessageKey),
}

/// Builds one outgoing [`Message`] by appending typed values.
///
/// One encoder per message (or per sub-message). The lifetime parameter is
/// the lifetime of any borrowed byte blobs appended through
/// [`append_bytes_borrowed`](Self::append_bytes_borrowed); fully owned
/// messages are `MessageEncoder<'static>`.
#[derive(Debug, Default)]
pub struct MessageEncoder<'a> {
    /// The message under construction.
    msg: Message<'a>,
}

impl<'a> MessageEncoder<'a> {
    /// Creates an encoder for a fresh, empty message.
    pub const fn new() -> Self {
        Self {
            msg: Message::new(),
        }
    }

    /// Appends a 32-bit signed integer.
    pub fn append_i32(&mut self, key: MessageKey, value: i32) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Int32(value))
    }

    /// Appends a 64-bit signed integer.
    pub fn append_i64(&mut self, key: MessageKey, value: i64) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Int64(value))
    }

    /// Appends a pointer-width value (byte counts, host refs).
    pub fn append_size(&mut self, key: MessageKey, value: u64) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Size(value))
    }

    /// Appends a 32-bit float.
    pub fn append_f32(&mut self, key: MessageKey, value: f32) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Float(value))
    }

    /// Appends a 64-bit double.
    pub fn append_f64(&mut self, key: MessageKey, value: f64) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Double(value))
    }

    /// Appends a UTF-8 string. The text is copied into the message;
    /// interior NUL bytes are rejected.
    pub fn append_str(&mut self, key: MessageKey, value: &str) -> Result<(), EncodeError> {
        if value.as_bytes().contains(&0) {
            return Err(EncodeError::NulInString(key));
        }
        self.msg
            .insert(key, Value::String(Cow::Owned(value.to_owned())))
    }

    /// Appends a byte blob, copying it into the message.
    pub fn append_bytes(&mut self, key: MessageKey, value: &[u8]) -> Result<(), EncodeError> {
        self.msg
            .insert(key, Value::Bytes(Cow::Owned(value.to_vec())))
    }

    /// Appends a byte blob without copying.
    ///
    /// The borrow ties the source buffer's lifetime to the message, so
    /// "the memory must stay alive and unchanged until the send completes"
    /// is enforced by the compiler rather than left as a caller obligation.
    pub fn append_bytes_borrowed(
        &mut self,
        key: MessageKey,
        value: &'a [u8],
    ) -> Result<(), EncodeError> {
        self.msg.insert(key, Value::Bytes(Cow::Borrowed(value)))
    }

    /// Appends a nested sub-message built by `build`.
    ///
    /// The sub-encoder is scoped to the closure and attaches to the parent
    /// key when the closure succeeds; on error nothing is attached.
    pub fn append_sub<F>(&mut self, key: MessageKey, build: F) -> Result<(), EncodeError>
    where
        F: FnOnce(&mut MessageEncoder<'a>) -> Result<(), EncodeError>,
    {
        // Check the parent key before running the builder so a duplicate
        // does not waste the nested work.
        if self.msg.contains_key(key) {
            return Err(EncodeError::DuplicateKey(key));
        }
        let mut sub = MessageEncoder::new();
        build(&mut sub)?;
        self.msg.insert(key, Value::Sub(sub.finish()))
    }

    /// Finalizes the builder, yielding the message.
    ///
    /// Consuming the encoder is what freezes the message: there is no way
    /// to keep appending once it has been handed to the transport.
    pub fn finish(self) -> Message<'a> {
        self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_appends_land_under_their_keys() {
        let mut enc = MessageEncoder::new();
        enc.append_i32(0, -7).unwrap();
        enc.append_i64(1, i64::MIN).unwrap();
        enc.append_size(2, 4096).unwrap();
        enc.append_f32(3, 1.5).unwrap();
        enc.append_f64(4, -0.25).unwrap();
        enc.append_str(5, "héllo").unwrap();
        enc.append_bytes(6, &[1, 2, 3]).unwrap();

        let msg = enc.finish();
        assert_eq!(msg.len(), 7);
        assert_eq!(msg.get(0), Some(&Value::Int32(-7)));
        assert_eq!(msg.get(1), Some(&Value::Int64(i64::MIN)));
        assert!(matches!(msg.get(5), Some(Value::String(s)) if s == "héllo"));
    }

    #[test]
    fn duplicate_key_across_types_rejected() {
        let mut enc = MessageEncoder::new();
        enc.append_i32(9, 1).unwrap();
        // Same key with a different type is still a duplicate.
        assert_eq!(
            enc.append_str(9, "x"),
            Err(EncodeError::DuplicateKey(9))
        );
    }

    #[test]
    fn interior_nul_rejected() {
        let mut enc = MessageEncoder::new();
        assert_eq!(
            enc.append_str(0, "a\0b"),
            Err(EncodeError::NulInString(0))
        );
        let msg = enc.finish();
        assert!(msg.is_empty());
    }

    #[test]
    fn borrowed_bytes_are_not_copied() {
        let buf = vec![0xABu8; 32];
        let mut enc = MessageEncoder::new();
        enc.append_bytes_borrowed(0, &buf).unwrap();
        let msg = enc.finish();
        match msg.get(0) {
            Some(Value::Bytes(Cow::Borrowed(b))) => {
                assert!(std::ptr::eq(*b, buf.as_slice()));
            }
            other => panic!("expected borrowed bytes, got {other:?}"),
        }
    }

    #[test]
    fn sub_message_attaches_on_success_only() {
        let mut enc = MessageEncoder::new();
        enc.append_sub(1, |sub| {
            sub.append_i32(0, 10)?;
            sub.append_i32(1, 20)
        })
        .unwrap();

        // A failing builder attaches nothing.
        let err = enc.append_sub(2, |sub| {
            sub.append_i32(0, 1)?;
            sub.append_i32(0, 2)
        });
        assert_eq!(err, Err(EncodeError::DuplicateKey(0)));

        let msg = enc.finish();
        assert!(msg.contains_key(1));
        assert!(!msg.contains_key(2));
    }

    #[test]
    fn sub_message_duplicate_parent_key_rejected() {
        let mut enc = MessageEncoder::new();
        enc.append_i32(4, 0).unwrap();
        let err = enc.append_sub(4, |_| Ok(()));
        assert_eq!(err, Err(EncodeError::DuplicateKey(4)));
    }
}
