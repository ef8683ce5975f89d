//! Serialization of `Object` property values.
//!
//! Complex values are stored as opaque bincode bytes in a BLOB column. The
//! reading side names the concrete type it expects, so no type registry is
//! persisted alongside the bytes.

pub mod bincode;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Encodes a value for storage in an `Object` column.
pub fn encode_object<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    self::bincode::serialize(value)
}

/// Decodes a value previously written by [`encode_object`].
pub fn decode_object<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    self::bincode::deserialize(bytes)
}
