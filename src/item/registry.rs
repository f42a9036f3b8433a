//! Maps item type tags to constructors for the receiving side.

use super::{property_str, FileItem, Item, Properties, FILE_TYPE, PROP_TYPE};
use crate::error::{Result, TransferError};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Builds an item from its decoded header and the destination root.
pub type ItemConstructor = Arc<dyn Fn(&Properties, &Path) -> Result<Box<dyn Item>> + Send + Sync>;

#[derive(Clone)]
pub struct ItemRegistry {
    constructors: HashMap<String, ItemConstructor>,
}

impl ItemRegistry {
    /// A registry with no item types at all.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register (or replace) the constructor for `item_type`.
    pub fn register<F>(&mut self, item_type: impl Into<String>, constructor: F)
    where
        F: Fn(&Properties, &Path) -> Result<Box<dyn Item>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(item_type.into(), Arc::new(constructor));
    }

    pub fn contains(&self, item_type: &str) -> bool {
        self.constructors.contains_key(item_type)
    }

    /// Build the item described by `props`.
    pub fn create(&self, props: &Properties, root: &Path) -> Result<Box<dyn Item>> {
        let item_type = property_str(props, PROP_TYPE)?;
        let constructor = self.constructors.get(item_type).ok_or_else(|| {
            TransferError::protocol(format!("unrecognized item type {:?}", item_type))
        })?;
        constructor(props, root)
    }
}

impl Default for ItemRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(FILE_TYPE, |props, root| {
            Ok(Box::new(FileItem::from_properties(props, root)?) as Box<dyn Item>)
        });
        registry
    }
}

impl fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ItemRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{base_properties, OpenMode};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[derive(Debug)]
    struct NoteItem {
        text: String,
    }

    #[async_trait]
    impl Item for NoteItem {
        fn item_type(&self) -> &str {
            "note"
        }
        fn name(&self) -> &str {
            "note"
        }
        fn size(&self) -> u64 {
            self.text.len() as u64
        }
        fn properties(&self) -> Properties {
            base_properties("note", "note", self.size())
        }
        async fn open(&mut self, _mode: OpenMode) -> Result<()> {
            Ok(())
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.text.push_str(&String::from_utf8_lossy(data));
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_default_registry_builds_files() {
        let tmp = TempDir::new().unwrap();
        let registry = ItemRegistry::default();
        assert!(registry.contains(FILE_TYPE));

        let item = registry
            .create(&props(json!({"type": "file", "name": "a.txt", "size": "5"})), tmp.path())
            .unwrap();
        assert_eq!(item.item_type(), "file");
        assert_eq!(item.size(), 5);
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let tmp = TempDir::new().unwrap();
        let registry = ItemRegistry::default();
        let result = registry.create(&props(json!({"type": "url", "name": "x", "size": "0"})), tmp.path());
        assert!(matches!(result, Err(TransferError::Protocol(_))));

        let missing = registry.create(&props(json!({"name": "x", "size": "0"})), tmp.path());
        assert!(matches!(missing, Err(TransferError::Protocol(_))));
    }

    #[test]
    fn test_register_custom_type() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ItemRegistry::default();
        registry.register("note", |_props, _root| {
            Ok(Box::new(NoteItem {
                text: String::new(),
            }) as Box<dyn Item>)
        });

        let item = registry
            .create(&props(json!({"type": "note", "name": "note", "size": "0"})), tmp.path())
            .unwrap();
        assert_eq!(item.item_type(), "note");
        assert!(format!("{:?}", registry).contains("note"));
    }
}
