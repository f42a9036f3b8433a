//! Transfer header: the first Metadata packet of every transfer.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `{"name": ..., "count": "<int>", "size": "<int>"}`
///
/// Integers travel as strings so that peers with narrow JSON number types
/// never lose precision on large sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    /// Name of the sending device.
    pub name: String,
    /// Number of items that follow.
    #[serde(with = "string_u64")]
    pub count: u64,
    /// Total content bytes across all items.
    #[serde(with = "string_u64")]
    pub size: u64,
}

impl TransferHeader {
    pub fn new(name: impl Into<String>, count: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            count,
            size,
        }
    }
}

/// Serialize a u64 as a decimal string; accept either a string or a number.
pub mod string_u64 {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrNumber {
            String(String),
            Number(u64),
        }

        match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::String(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid integer string: {:?}", s))),
            StringOrNumber::Number(n) => Ok(n),
        }
    }
}
