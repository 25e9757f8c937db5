//! Read-only typed views over received messages.

use crate::message::{
    InstanceRef, Message, MessageKey, Value, KEY_ERROR, KEY_INSTANCE_REF,
};

/// Read-only view over a received [`Message`].
///
/// Every typed accessor answers `None` when the key is absent or holds a
/// value of a different type — absence is a normal, queryable condition,
/// never an error. String and byte views alias memory owned by the parent
/// message and are only valid for its lifetime; copy out for longer
/// retention.
#[derive(Debug, Clone, Copy)]
pub struct MessageDecoder<'m> {
    /// The message being read.
    msg: &'m Message<'m>,
}

impl<'m> MessageDecoder<'m> {
    /// Wraps a message. Usually reached via [`Message::decoder`].
    pub(crate) const fn over(msg: &'m Message<'m>) -> Self {
        Self { msg }
    }

    /// Reads a 32-bit signed integer.
    pub fn read_i32(&self, key: MessageKey) -> Option<i32> {
        match self.msg.get(key)? {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a 64-bit signed integer.
    pub fn read_i64(&self, key: MessageKey) -> Option<i64> {
        match self.msg.get(key)? {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a pointer-width value (byte counts, host refs).
    pub fn read_size(&self, key: MessageKey) -> Option<u64> {
        match self.msg.get(key)? {
            Value::Size(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a 32-bit float.
    pub fn read_f32(&self, key: MessageKey) -> Option<f32> {
        match self.msg.get(key)? {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a 64-bit double.
    pub fn read_f64(&self, key: MessageKey) -> Option<f64> {
        match self.msg.get(key)? {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a string as a view into the message's memory.
    pub fn read_str(&self, key: MessageKey) -> Option<&'m str> {
        match self.msg.get(key)? {
            Value::String(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// First phase of the blob protocol: reports the blob's size so the
    /// caller can provision a buffer for [`read_bytes_into`](Self::read_bytes_into).
    pub fn read_bytes_size(&self, key: MessageKey) -> Option<usize> {
        self.read_bytes(key).map(<[u8]>::len)
    }

    /// Second phase of the blob protocol: copies the blob into `buf`.
    ///
    /// Returns `false` if the key is absent, not a blob, or `buf` does not
    /// have exactly the size reported by [`read_bytes_size`](Self::read_bytes_size);
    /// in that case `buf` is untouched.
    pub fn read_bytes_into(&self, key: MessageKey, buf: &mut [u8]) -> bool {
        match self.read_bytes(key) {
            Some(bytes) if bytes.len() == buf.len() => {
                buf.copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Reads a byte blob as a view into the message's memory.
    pub fn read_bytes(&self, key: MessageKey) -> Option<&'m [u8]> {
        match self.msg.get(key)? {
            Value::Bytes(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    /// Reads a nested sub-message; `None` if the key is absent or the
    /// value is not a sub-message. The returned decoder borrows from the
    /// same parent message.
    pub fn read_sub(&self, key: MessageKey) -> Option<MessageDecoder<'m>> {
        match self.msg.get(key)? {
            Value::Sub(sub) => Some(sub.decoder()),
            _ => None,
        }
    }

    /// Reads the routing target stored under [`KEY_INSTANCE_REF`].
    pub fn read_instance_ref(&self) -> Option<InstanceRef> {
        self.read_size(KEY_INSTANCE_REF).map(InstanceRef::from_raw)
    }

    /// Reads the dispatch-failure marker stored under [`KEY_ERROR`].
    /// A reply carrying this marker is a failed call, not a void success.
    pub fn read_error(&self) -> Option<&'m str> {
        self.read_str(KEY_ERROR)
    }

    /// Answers presence for a key without decoding its value.
    pub fn contains_key(&self, key: MessageKey) -> bool {
        self.msg.contains_key(key)
    }

    /// Debugging/validation helper: `true` if the message holds nothing.
    pub fn is_empty(&self) -> bool {
        self.msg.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::MessageEncoder;

    fn sample() -> Message<'static> {
        let mut enc = MessageEncoder::new();
        enc.append_i32(0, i32::MIN).unwrap();
        enc.append_i32(1, i32::MAX).unwrap();
        enc.append_i64(2, -1).unwrap();
        enc.append_size(3, u64::MAX).unwrap();
        enc.append_f32(4, 2.25).unwrap();
        enc.append_f64(5, -1e300).unwrap();
        enc.append_str(6, "").unwrap();
        enc.append_str(7, "text").unwrap();
        enc.append_bytes(8, &[]).unwrap();
        enc.append_bytes(9, &[0xDE, 0xAD]).unwrap();
        enc.append_sub(10, |l1| {
            l1.append_i32(0, 1)?;
            l1.append_sub(1, |l2| {
                l2.append_str(0, "deep")?;
                l2.append_sub(1, |l3| l3.append_i64(0, 3))
            })
        })
        .unwrap();
        enc.finish()
    }

    #[test]
    fn round_trip_every_type() {
        let msg = sample();
        let dec = msg.decoder();
        assert_eq!(dec.read_i32(0), Some(i32::MIN));
        assert_eq!(dec.read_i32(1), Some(i32::MAX));
        assert_eq!(dec.read_i64(2), Some(-1));
        assert_eq!(dec.read_size(3), Some(u64::MAX));
        assert_eq!(dec.read_f32(4), Some(2.25));
        assert_eq!(dec.read_f64(5), Some(-1e300));
        assert_eq!(dec.read_str(6), Some(""));
        assert_eq!(dec.read_str(7), Some("text"));
        assert_eq!(dec.read_bytes(8), Some(&[][..]));
        assert_eq!(dec.read_bytes(9), Some(&[0xDE, 0xAD][..]));
    }

    #[test]
    fn three_level_nesting() {
        let msg = sample();
        let dec = msg.decoder();
        let l1 = dec.read_sub(10).unwrap();
        assert_eq!(l1.read_i32(0), Some(1));
        let l2 = l1.read_sub(1).unwrap();
        assert_eq!(l2.read_str(0), Some("deep"));
        let l3 = l2.read_sub(1).unwrap();
        assert_eq!(l3.read_i64(0), Some(3));
        assert!(l3.read_sub(1).is_none());
    }

    #[test]
    fn absence_is_none_for_every_accessor() {
        let msg = sample();
        let dec = msg.decoder();
        let key = 999;
        assert_eq!(dec.read_i32(key), None);
        assert_eq!(dec.read_i64(key), None);
        assert_eq!(dec.read_size(key), None);
        assert_eq!(dec.read_f32(key), None);
        assert_eq!(dec.read_f64(key), None);
        assert_eq!(dec.read_str(key), None);
        assert_eq!(dec.read_bytes(key), None);
        assert_eq!(dec.read_bytes_size(key), None);
        assert!(dec.read_sub(key).is_none());
        assert!(!dec.contains_key(key));

        let mut buf = [0u8; 4];
        assert!(!dec.read_bytes_into(key, &mut buf));
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn no_implicit_type_coercion() {
        let msg = sample();
        let dec = msg.decoder();
        // Key 0 holds an Int32; every other accessor must refuse it.
        assert_eq!(dec.read_i64(0), None);
        assert_eq!(dec.read_size(0), None);
        assert_eq!(dec.read_f32(0), None);
        assert_eq!(dec.read_str(0), None);
        assert_eq!(dec.read_bytes(0), None);
        assert!(dec.read_sub(0).is_none());
        // But presence is still visible.
        assert!(dec.contains_key(0));
    }

    #[test]
    fn two_phase_blob_read() {
        let msg = sample();
        let dec = msg.decoder();
        let size = dec.read_bytes_size(9).unwrap();
        let mut buf = vec![0u8; size];
        assert!(dec.read_bytes_into(9, &mut buf));
        assert_eq!(buf, vec![0xDE, 0xAD]);

        // Wrong-sized buffer is refused.
        let mut short = vec![0u8; size - 1];
        assert!(!dec.read_bytes_into(9, &mut short));
    }

    #[test]
    fn key_isolation_across_nesting() {
        let msg = sample();
        let dec = msg.decoder();
        // Keys inside the sub-message do not leak into the parent space.
        assert_eq!(dec.read_i32(0), Some(i32::MIN));
        let sub = dec.read_sub(10).unwrap();
        assert_eq!(sub.read_i32(0), Some(1));
        assert!(sub.read_str(7).is_none());
    }

    #[test]
    fn empty_message_reports_empty() {
        let msg = Message::new();
        assert!(msg.decoder().is_empty());
        assert!(!sample().decoder().is_empty());
    }
}
