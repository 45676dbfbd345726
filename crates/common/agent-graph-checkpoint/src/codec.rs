//! Snapshot codec.
//!
//! Converts the executor's state value and its write-set into tagged bytes.
//! The tag travels with the bytes, so a backend never needs to know which
//! format produced a payload.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CheckpointError, Result};

/// Wire format used for an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerdeFormat {
    /// MessagePack with named struct fields.
    #[default]
    MsgPack,
    /// Plain JSON, handy when the database is inspected by hand.
    Json,
}

impl SerdeFormat {
    /// Tag stored next to the bytes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MsgPack => "msgpack",
            Self::Json => "json",
        }
    }

    /// Parse a stored tag.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "msgpack" => Ok(Self::MsgPack),
            "json" => Ok(Self::Json),
            other => Err(CheckpointError::Serialization(format!(
                "unknown payload format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SerdeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded payload plus the format it was encoded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub format: SerdeFormat,
    pub bytes: Vec<u8>,
}

impl EncodedValue {
    /// Wrap bytes already encoded with `format`.
    pub fn new(format: SerdeFormat, bytes: Vec<u8>) -> Self {
        Self { format, bytes }
    }

    /// Size of the encoded bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether there are no encoded bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encoder/decoder for state snapshots and write-sets.
///
/// Encoding uses the configured format; decoding honours the format tag of
/// the payload, so a saver may switch formats without rewriting history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSerde {
    format: SerdeFormat,
}

impl SnapshotSerde {
    /// Create a codec that encodes with `format`.
    pub fn new(format: SerdeFormat) -> Self {
        Self { format }
    }

    /// Codec that writes JSON payloads.
    pub fn json() -> Self {
        Self::new(SerdeFormat::Json)
    }

    /// The format used for encoding.
    pub fn format(&self) -> SerdeFormat {
        self.format
    }

    /// Encode a value.
    pub fn encode<T>(&self, value: &T) -> Result<EncodedValue>
    where
        T: Serialize + ?Sized,
    {
        let bytes = match self.format {
            SerdeFormat::MsgPack => rmp_serde::to_vec_named(value)?,
            SerdeFormat::Json => serde_json::to_vec(value)?,
        };
        Ok(EncodedValue::new(self.format, bytes))
    }

    /// Decode a value previously produced by [`SnapshotSerde::encode`].
    pub fn decode<T>(&self, encoded: &EncodedValue) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = match encoded.format {
            SerdeFormat::MsgPack => rmp_serde::from_slice(&encoded.bytes)?,
            SerdeFormat::Json => serde_json::from_slice(&encoded.bytes)?,
        };
        Ok(value)
    }
}
