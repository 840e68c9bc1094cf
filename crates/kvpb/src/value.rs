//! Tagged value encoding.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;

const TAG_INT: u8 = 1;
const TAG_BYTES: u8 = 3;
const TAG_MESSAGE: u8 = 6;

/// A stored value: a one-byte type tag followed by the payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    raw: Bytes,
}

impl Value {
    fn tagged(tag: u8, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(tag);
        buf.put_slice(payload);
        Self { raw: buf.freeze() }
    }

    /// An opaque byte value.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::tagged(TAG_BYTES, bytes)
    }

    /// An integer value.
    #[must_use]
    pub fn from_int(value: i64) -> Self {
        Self::tagged(TAG_INT, &value.to_be_bytes())
    }

    /// A serialized message.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be encoded.
    pub fn from_message<T: Serialize>(message: &T) -> Result<Self, ValueError> {
        let mut payload = Vec::new();
        ciborium::into_writer(message, &mut payload)
            .map_err(|e| ValueError::Encode(e.to_string()))?;
        Ok(Self::tagged(TAG_MESSAGE, &payload))
    }

    /// Rebuild a value from its raw encoding.
    #[must_use]
    pub const fn from_raw(raw: Bytes) -> Self {
        Self { raw }
    }

    /// Raw encoding including the tag.
    #[must_use]
    pub const fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the value has no encoding at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn payload(&self, expected: u8) -> Result<&[u8], ValueError> {
        match self.raw.split_first() {
            Some((&tag, payload)) if tag == expected => Ok(payload),
            Some((&tag, _)) => Err(ValueError::UnexpectedTag { expected, found: tag }),
            None => Err(ValueError::Empty),
        }
    }

    /// Decode an integer value.
    ///
    /// # Errors
    ///
    /// Fails if the value is not an integer.
    pub fn get_int(&self) -> Result<i64, ValueError> {
        let payload = self.payload(TAG_INT)?;
        let bytes: [u8; 8] = payload.try_into().map_err(|_| ValueError::Malformed(payload.len()))?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Decode a byte value.
    ///
    /// # Errors
    ///
    /// Fails if the value is not a byte value.
    pub fn get_bytes(&self) -> Result<Bytes, ValueError> {
        self.payload(TAG_BYTES)?;
        Ok(self.raw.slice(1..))
    }

    /// Decode a serialized message.
    ///
    /// # Errors
    ///
    /// Fails if the value is not a message or does not decode as `T`.
    pub fn get_message<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        let payload = self.payload(TAG_MESSAGE)?;
        ciborium::from_reader(payload).map_err(|e| ValueError::Decode(e.to_string()))
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Ok(v) = self.get_int() {
            return write!(f, "Int({v})");
        }
        write!(f, "Value(0x{})", hex::encode(&self.raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_decoding_rejects_bytes() {
        let value = Value::from_bytes(b"xyz");
        assert!(matches!(value.get_int(), Err(ValueError::UnexpectedTag { .. })));
        assert_eq!(Value::from_int(-42).get_int().unwrap(), -42);
    }

    #[test]
    fn messages_decode_to_their_type() {
        let value = Value::from_message(&("range", 7u64)).unwrap();
        let (name, id): (String, u64) = value.get_message().unwrap();
        assert_eq!(name, "range");
        assert_eq!(id, 7);
    }

    #[test]
    fn empty_value_is_an_error() {
        let value = Value::from_raw(Bytes::new());
        assert!(matches!(value.get_bytes(), Err(ValueError::Empty)));
    }
}
