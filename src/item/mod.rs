//! Transferable items.
//!
//! An [`Item`] describes itself with a property map (sent as the item
//! header) and moves its content through `read`/`write`. The receiving side
//! rebuilds items from their property maps through an [`ItemRegistry`].

pub mod bundle;
pub mod file;
pub mod registry;

pub use bundle::Bundle;
pub use file::{FileItem, FILE_TYPE};
pub use registry::{ItemConstructor, ItemRegistry};

use crate::error::{Result, TransferError};
use async_trait::async_trait;
use serde_json::Value;

/// Key/value description of an item, sent as a JSON object.
pub type Properties = serde_json::Map<String, Value>;

pub const PROP_TYPE: &str = "type";
pub const PROP_NAME: &str = "name";
pub const PROP_SIZE: &str = "size";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[async_trait]
pub trait Item: Send + std::fmt::Debug {
    /// Type tag used to pick a constructor on the receiving side.
    fn item_type(&self) -> &str;

    /// Display name, relative path for files.
    fn name(&self) -> &str;

    /// Content size in bytes. Zero means there is no content phase.
    fn size(&self) -> u64;

    /// Full property map, including `type`, `name` and `size`.
    fn properties(&self) -> Properties;

    async fn open(&mut self, mode: OpenMode) -> Result<()>;

    /// Fill `buf` with the next content bytes. Returns 0 once exhausted.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the item, applying any deferred attributes.
    async fn close(&mut self) -> Result<()>;

    /// Release resources after a failed transfer without applying attributes.
    async fn abort(&mut self) {}

    /// Whether the item still has attributes to apply after every item of the
    /// transfer has arrived.
    fn has_deferred_attributes(&self) -> bool {
        false
    }

    /// Apply deferred attributes. Receivers call this once the last item is
    /// closed, newest item first, so children settle before their parents.
    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The mandatory properties every item carries. `size` is a string on the wire.
pub fn base_properties(item_type: &str, name: &str, size: u64) -> Properties {
    let mut props = Properties::new();
    props.insert(PROP_TYPE.to_string(), Value::String(item_type.to_string()));
    props.insert(PROP_NAME.to_string(), Value::String(name.to_string()));
    props.insert(PROP_SIZE.to_string(), Value::String(size.to_string()));
    props
}

pub fn property_str<'a>(props: &'a Properties, key: &str) -> Result<&'a str> {
    match props.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(TransferError::protocol(format!(
            "item property {:?} must be a string, got {}",
            key, other
        ))),
        None => Err(TransferError::protocol(format!(
            "item property {:?} is missing",
            key
        ))),
    }
}

/// Integer property, accepting decimal strings or JSON numbers.
pub fn property_u64(props: &Properties, key: &str) -> Result<u64> {
    let parsed = match props.get(key) {
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        None => {
            return Err(TransferError::protocol(format!(
                "item property {:?} is missing",
                key
            )))
        }
        Some(_) => None,
    };
    parsed.ok_or_else(|| {
        TransferError::protocol(format!("item property {:?} is not an unsigned integer", key))
    })
}

pub fn property_i64(props: &Properties, key: &str) -> Option<i64> {
    match props.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Boolean property; absent or unrecognised values read as `false`.
pub fn property_bool(props: &Properties, key: &str) -> bool {
    match props.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_base_properties_encode_size_as_string() {
        let p = base_properties("file", "a.txt", 12);
        assert_eq!(Value::Object(p), json!({"type": "file", "name": "a.txt", "size": "12"}));
    }

    #[test]
    fn test_property_u64() {
        let p = props(json!({"a": "42", "b": 7, "c": "x", "d": true}));
        assert_eq!(property_u64(&p, "a").unwrap(), 42);
        assert_eq!(property_u64(&p, "b").unwrap(), 7);
        assert!(property_u64(&p, "c").is_err());
        assert!(property_u64(&p, "d").is_err());
        assert!(property_u64(&p, "missing").is_err());
    }

    #[test]
    fn test_property_bool_and_str() {
        let p = props(json!({"a": true, "b": "true", "c": "no", "name": "x", "n": 1}));
        assert!(property_bool(&p, "a"));
        assert!(property_bool(&p, "b"));
        assert!(!property_bool(&p, "c"));
        assert!(!property_bool(&p, "missing"));
        assert_eq!(property_str(&p, "name").unwrap(), "x");
        assert!(property_str(&p, "n").is_err());
    }
}
