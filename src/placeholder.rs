//! Placeholder descriptors for archived persistent objects
//!
//! A persistent object nested inside a serialized container is replaced on
//! the way out by a small {type, table, id} descriptor, and resolved back
//! to a live object through the data store on the way in. Objects are
//! flushed before substitution so the descriptor always points at a saved
//! row.

use crate::object::{DbObject, ObjectId};
use crate::store::DataStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tag key marking a placeholder inside an archived JSON tree
pub const PLACEHOLDER_TAG: &str = "__rowkit_placeholder__";

/// {type, table, id} descriptor standing in for a live object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub class_name: String,
    pub table_name: String,
    pub object_id: ObjectId,
}

impl Placeholder {
    pub fn new(
        class_name: impl Into<String>,
        table_name: impl Into<String>,
        object_id: ObjectId,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            table_name: table_name.into(),
            object_id,
        }
    }

    /// Descriptor for a live object, creating or saving it first so the
    /// referenced row exists and is current
    pub fn for_object(object: &Arc<DbObject>) -> Result<Self> {
        if object.data_store().is_none() {
            return Err(Error::state(
                "cannot archive an object that has no data store",
            ));
        }
        if !object.has_been_created() {
            object.create()?;
        } else if object.has_unsaved_changes() {
            object.save()?;
        }
        Ok(Self::new(object.type_name(), object.table_name(), object.object_id()))
    }

    /// The live object this descriptor stands for
    pub fn resolve(&self, store: &Arc<DataStore>) -> Result<Arc<DbObject>> {
        store.object_from_table(&self.table_name, self.object_id)
    }

    /// Tagged JSON form, recognizable on decode
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::json!({ PLACEHOLDER_TAG: self })
    }

    /// Parse a tagged JSON value back into a descriptor, or None if the
    /// value is not a placeholder
    pub fn from_json_value(value: &serde_json::Value) -> Option<Self> {
        let inner = value.get(PLACEHOLDER_TAG)?;
        serde_json::from_value(inner.clone()).ok()
    }
}

/// One element of an archived container: either a plain value or a live
/// persistent object
#[derive(Debug, Clone)]
pub enum ArchiveItem {
    Plain(serde_json::Value),
    Object(Arc<DbObject>),
}

/// Encode a container, substituting every persistent object with its
/// placeholder descriptor
pub fn encode_archived(items: &[ArchiveItem]) -> Result<serde_json::Value> {
    let mut encoded = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ArchiveItem::Plain(value) => encoded.push(value.clone()),
            ArchiveItem::Object(object) => {
                encoded.push(Placeholder::for_object(object)?.to_json_value());
            }
        }
    }
    Ok(serde_json::Value::Array(encoded))
}

/// Decode an archived container, resolving every placeholder descriptor
/// back to a live object from the store
pub fn decode_archived(store: &Arc<DataStore>, value: &serde_json::Value) -> Result<Vec<ArchiveItem>> {
    let elements = value
        .as_array()
        .ok_or_else(|| Error::state("archived container is not an array"))?;
    let mut items = Vec::with_capacity(elements.len());
    for element in elements {
        match Placeholder::from_json_value(element) {
            Some(placeholder) => items.push(ArchiveItem::Object(placeholder.resolve(store)?)),
            None => items.push(ArchiveItem::Plain(element.clone())),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectClass;

    fn loaded_store() -> Arc<DataStore> {
        let store = DataStore::open_in_memory().unwrap();
        store
            .register_migration("001_pets", "CREATE TABLE pets (name TEXT, legs INTEGER)")
            .unwrap();
        store.associate_object_class(ObjectClass::new("Pet", "pets"));
        store.load_and_perform_any_required_migrations().unwrap();
        store
    }

    #[test]
    fn test_placeholder_exposes_type_table_id() {
        let store = loaded_store();
        let pet = store.new_object_in_table("pets").unwrap();
        pet.set_value_for_column("name", "rex").unwrap();

        let placeholder = Placeholder::for_object(&pet).unwrap();
        assert_eq!(placeholder.class_name, "Pet");
        assert_eq!(placeholder.table_name, "pets");
        assert_eq!(placeholder.object_id, pet.object_id());
        // for_object created the row
        assert!(pet.has_been_created());
    }

    #[test]
    fn test_placeholder_flushes_unsaved_changes() {
        let store = loaded_store();
        let pet = store.new_object_in_table("pets").unwrap();
        pet.set_value_for_column("name", "rex").unwrap();
        store.insert_object(&pet).unwrap();
        pet.set_value_for_column("legs", 4).unwrap();

        Placeholder::for_object(&pet).unwrap();
        assert!(!pet.has_unsaved_changes());
    }

    #[test]
    fn test_resolve_returns_live_object() {
        let store = loaded_store();
        let pet = store.new_object_in_table("pets").unwrap();
        pet.set_value_for_column("name", "rex").unwrap();
        let placeholder = Placeholder::for_object(&pet).unwrap();

        let resolved = placeholder.resolve(&store).unwrap();
        assert!(Arc::ptr_eq(&pet, &resolved));
    }

    #[test]
    fn test_archive_round_trip() {
        let store = loaded_store();
        let pet = store.new_object_in_table("pets").unwrap();
        pet.set_value_for_column("name", "rex").unwrap();
        let id_before = {
            let items = vec![
                ArchiveItem::Plain(serde_json::json!("a note")),
                ArchiveItem::Object(pet.clone()),
                ArchiveItem::Plain(serde_json::json!(42)),
            ];
            let encoded = encode_archived(&items).unwrap();
            let text = serde_json::to_string(&encoded).unwrap();

            let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            let decoded = decode_archived(&store, &reparsed).unwrap();
            assert_eq!(decoded.len(), 3);
            match (&decoded[0], &decoded[1], &decoded[2]) {
                (ArchiveItem::Plain(a), ArchiveItem::Object(obj), ArchiveItem::Plain(c)) => {
                    assert_eq!(a, &serde_json::json!("a note"));
                    assert_eq!(c, &serde_json::json!(42));
                    assert!(Arc::ptr_eq(obj, &pet));
                    obj.object_id()
                }
                other => panic!("unexpected decoded shapes: {other:?}"),
            }
        };
        assert_eq!(pet.object_id(), id_before);
    }

    #[test]
    fn test_unassociated_object_cannot_be_archived() {
        let pet = DbObject::new(Arc::new(ObjectClass::new("Pet", "pets")));
        let err = Placeholder::for_object(&pet).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_non_placeholder_values_pass_through() {
        let value = serde_json::json!({"name": "plain map"});
        assert!(Placeholder::from_json_value(&value).is_none());

        let tagged = Placeholder::new("Pet", "pets", 9).to_json_value();
        let parsed = Placeholder::from_json_value(&tagged).unwrap();
        assert_eq!(parsed, Placeholder::new("Pet", "pets", 9));
    }
}
