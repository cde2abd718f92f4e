//! Persistent object - one live, mutable object per table row
//!
//! A `DbObject` represents a single row: lazily loaded column values,
//! pending (unsaved) changes, and a create/save/delete lifecycle. A value
//! in pending changes always wins over the loaded value when read. The row
//! id only moves forward: not-yet-assigned to assigned on create, and it
//! stays readable after delete so callers can inspect what was removed.

use crate::naming;
use crate::store::DataStore;
use crate::value::Value;
use crate::{Error, Result};
use rusqlite::params_from_iter;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::debug;

/// Integer key identifying a row within a table
pub type ObjectId = i64;

/// Sentinel: an invalid object id
pub const OBJECT_ID_INVALID: ObjectId = i64::MAX;

/// Sentinel: an object in the process of being created, with no row id yet
pub const OBJECT_ID_NOT_YET_ASSIGNED: ObjectId = i64::MAX - 1;

/// Declarative per-type descriptor: type name, table, and primary key.
/// Built once and registered with the data store; lookups for the table
/// then vend objects carrying this class.
#[derive(Debug, Clone)]
pub struct ObjectClass {
    type_name: String,
    table_name: String,
    primary_key: String,
}

/// Default primary key: every SQLite table row has a unique row id
pub const DEFAULT_PRIMARY_KEY: &str = "_ROWID_";

impl ObjectClass {
    pub fn new(type_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table_name: table_name.into(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
        }
    }

    /// Use an alternate primary-key column instead of `_ROWID_`
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// The generic class vended for tables with no associated type
    pub fn generic(table_name: impl Into<String>) -> Self {
        Self::new("DbObject", table_name)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
}

struct ObjectState {
    id: ObjectId,
    loaded: bool,
    deleted: bool,
    registered: bool,
    loaded_columns: HashMap<String, Value>,
    pending_changes: HashMap<String, Value>,
}

impl ObjectState {
    fn new(id: ObjectId) -> Self {
        Self {
            id,
            loaded: false,
            deleted: false,
            registered: false,
            loaded_columns: HashMap::new(),
            pending_changes: HashMap::new(),
        }
    }

    fn has_been_created(&self) -> bool {
        self.id != OBJECT_ID_INVALID && self.id != OBJECT_ID_NOT_YET_ASSIGNED
    }
}

/// A live object backed by one row of a table
pub struct DbObject {
    class: Arc<ObjectClass>,
    store: OnceLock<Arc<DataStore>>,
    // Handle to our own allocation, so `create` can register a weak
    // identity-cache entry without an Arc in hand.
    self_weak: Weak<DbObject>,
    state: Mutex<ObjectState>,
}

impl DbObject {
    /// A fresh, unassociated object with no row id. The object must be
    /// associated with a data store before it can load or save.
    pub fn new(class: Arc<ObjectClass>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            class,
            store: OnceLock::new(),
            self_weak: weak.clone(),
            state: Mutex::new(ObjectState::new(OBJECT_ID_NOT_YET_ASSIGNED)),
        })
    }

    /// Object bound to a store, representing an existing or pending row
    pub(crate) fn with_store(
        store: Arc<DataStore>,
        class: Arc<ObjectClass>,
        id: ObjectId,
    ) -> Arc<Self> {
        let object = Self::new(class);
        let _ = object.store.set(store);
        object.lock().id = id;
        object
    }

    #[cfg(test)]
    pub(crate) fn with_id(class: Arc<ObjectClass>, id: ObjectId) -> Arc<Self> {
        let object = Self::new(class);
        object.lock().id = id;
        object
    }

    fn lock(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========== Store association ==========

    /// One-way, permanent association with a data store. Re-associating an
    /// already-associated object is an invalid-state failure.
    pub fn associate_with(&self, store: &Arc<DataStore>) -> Result<()> {
        self.store
            .set(store.clone())
            .map_err(|_| Error::state("object is already associated with a data store"))
    }

    pub fn data_store(&self) -> Option<&Arc<DataStore>> {
        self.store.get()
    }

    fn store(&self) -> Result<&Arc<DataStore>> {
        self.store
            .get()
            .ok_or_else(|| Error::state("object is not associated with a data store"))
    }

    // ========== Identity ==========

    pub fn object_id(&self) -> ObjectId {
        self.lock().id
    }

    pub fn has_been_created(&self) -> bool {
        self.lock().has_been_created()
    }

    pub fn has_been_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn type_name(&self) -> &str {
        self.class.type_name()
    }

    pub fn table_name(&self) -> &str {
        self.class.table_name()
    }

    pub fn primary_key_name(&self) -> &str {
        self.class.primary_key()
    }

    pub fn object_class(&self) -> &Arc<ObjectClass> {
        &self.class
    }

    // ========== Loading ==========

    /// True until the first successful load; a fresh not-yet-assigned
    /// object needs no load.
    pub fn needs_loading(&self) -> bool {
        let state = self.lock();
        state.has_been_created() && !state.loaded && !state.deleted
    }

    /// Fetch this object's row and populate the loaded column values.
    /// Fails with `InvalidState` before an id is assigned, and with
    /// `NotFound` (marking the object deleted) when no row matches.
    pub fn load(&self) -> Result<()> {
        let mut state = self.lock();
        self.load_locked(&mut state)
    }

    /// Discard loaded values and fetch the row again, keeping any pending
    /// changes staged.
    pub fn reload(&self) -> Result<()> {
        let mut state = self.lock();
        state.loaded = false;
        state.loaded_columns.clear();
        self.load_locked(&mut state)
    }

    fn load_locked(&self, state: &mut ObjectState) -> Result<()> {
        if !state.has_been_created() {
            return Err(Error::state(format!(
                "cannot load '{}' object before it has a row id",
                self.table_name()
            )));
        }
        let store = self.store()?;
        store.ensure_loaded()?;

        let sql = self.load_sql();
        let id = state.id;
        let fetched = store.gateway().access(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => {
                    let mut values = HashMap::with_capacity(column_names.len());
                    for (i, name) in column_names.iter().enumerate() {
                        values.insert(name.clone(), row.get::<_, Value>(i)?);
                    }
                    Ok(Some(values))
                }
                None => Ok(None),
            }
        })?;

        match fetched {
            Some(values) => {
                state.loaded_columns = values;
                state.loaded = true;
                Ok(())
            }
            None => {
                state.deleted = true;
                Err(Error::NotFound { table: self.table_name().to_string(), id })
            }
        }
    }

    // ========== Column access ==========

    fn validate_column(&self, column_name: &str) -> Result<()> {
        // Unassociated objects stage freely; the store's schema cache is
        // the authority once one is attached.
        if let Some(store) = self.store.get() {
            if !store.table_has_column(self.table_name(), column_name)? {
                return Err(Error::state(format!(
                    "table '{}' has no column '{}'",
                    self.table_name(),
                    column_name
                )));
            }
        }
        Ok(())
    }

    /// The current value for a column: pending changes win over loaded
    /// values; an unloaded object loads lazily. Unknown columns fail.
    pub fn value_for_column(&self, column_name: &str) -> Result<Value> {
        self.validate_column(column_name)?;
        let mut state = self.lock();
        if let Some(pending) = state.pending_changes.get(column_name) {
            return Ok(pending.clone());
        }
        if let Some(loaded) = state.loaded_columns.get(column_name) {
            return Ok(loaded.clone());
        }
        if state.has_been_created() && !state.loaded && !state.deleted {
            self.load_locked(&mut state)?;
            if let Some(loaded) = state.loaded_columns.get(column_name) {
                return Ok(loaded.clone());
            }
        }
        Ok(Value::Null)
    }

    pub fn column_has_null_value(&self, column_name: &str) -> Result<bool> {
        Ok(self.value_for_column(column_name)?.is_null())
    }

    pub fn bool_for_column(&self, column_name: &str) -> Result<bool> {
        self.value_for_column(column_name)?.as_bool(column_name)
    }

    pub fn i64_for_column(&self, column_name: &str) -> Result<i64> {
        self.value_for_column(column_name)?.as_i64(column_name)
    }

    pub fn f64_for_column(&self, column_name: &str) -> Result<f64> {
        self.value_for_column(column_name)?.as_f64(column_name)
    }

    pub fn string_for_column(&self, column_name: &str) -> Result<String> {
        Ok(self.value_for_column(column_name)?.as_str(column_name)?.to_string())
    }

    pub fn blob_for_column(&self, column_name: &str) -> Result<Vec<u8>> {
        Ok(self.value_for_column(column_name)?.as_blob(column_name)?.to_vec())
    }

    /// Stage a value for a column. Nothing touches the engine until
    /// `save` or `create`. Unknown columns fail.
    pub fn set_value_for_column(&self, column_name: &str, value: impl Into<Value>) -> Result<()> {
        self.validate_column(column_name)?;
        self.lock().pending_changes.insert(column_name.to_string(), value.into());
        Ok(())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.lock().pending_changes.is_empty()
    }

    /// Discard pending changes without touching the engine
    pub fn revert(&self) {
        self.lock().pending_changes.clear();
    }

    // ========== Creation ==========

    /// Insert a new row for this object, assign the engine's new row id,
    /// and register into the store's identity cache. Valid only once.
    pub fn create(&self) -> Result<ObjectId> {
        let store = self.store()?.clone();
        store.ensure_loaded()?;
        let mut state = self.lock();
        if state.has_been_created() {
            return Err(Error::state(format!(
                "'{}' object already created with id {}",
                self.table_name(),
                state.id
            )));
        }
        if state.deleted {
            return Err(Error::state("cannot create a deleted object"));
        }

        let (sql, arguments) = Self::create_sql_locked(&self.class, &state);
        let new_id = store.gateway().access(|conn| {
            conn.execute(&sql, params_from_iter(arguments.iter()))?;
            Ok(conn.last_insert_rowid())
        })?;

        state.id = new_id;
        state.loaded = true;
        let pending = std::mem::take(&mut state.pending_changes);
        state.loaded_columns.extend(pending);

        store.cache().register(self.table_name(), new_id, self.self_weak.clone())?;
        state.registered = true;

        debug!(table = self.table_name(), id = new_id, "created object");
        Ok(new_id)
    }

    // ========== Saving ==========

    /// Flush pending changes as a single UPDATE touching exactly the
    /// changed columns. A no-op when nothing is pending. If the row has
    /// vanished, the object is marked deleted and `NotFound` is reported.
    pub fn save(&self) -> Result<()> {
        let store = self.store()?.clone();
        store.ensure_loaded()?;
        let mut state = self.lock();
        if !state.has_been_created() {
            return Err(Error::state(format!(
                "cannot save '{}' object before it is created",
                self.table_name()
            )));
        }
        if state.deleted {
            return Err(Error::NotFound { table: self.table_name().to_string(), id: state.id });
        }
        if state.pending_changes.is_empty() {
            return Ok(());
        }

        let (sql, arguments) = Self::save_sql_locked(&self.class, &state);
        let affected = store
            .gateway()
            .access(|conn| Ok(conn.execute(&sql, params_from_iter(arguments.iter()))?))?;

        if affected == 0 {
            state.deleted = true;
            return Err(Error::NotFound { table: self.table_name().to_string(), id: state.id });
        }

        let pending = std::mem::take(&mut state.pending_changes);
        state.loaded_columns.extend(pending);
        debug!(table = self.table_name(), id = state.id, "saved object");
        Ok(())
    }

    // ========== Deletion ==========

    /// Delete this object's row. The row id stays readable afterwards; the
    /// object leaves the identity cache so a reused row id vends a fresh
    /// instance.
    pub fn delete(&self) -> Result<()> {
        let store = self.store()?.clone();
        store.ensure_loaded()?;
        let mut state = self.lock();
        if !state.has_been_created() {
            return Err(Error::state(format!(
                "cannot delete '{}' object before it is created",
                self.table_name()
            )));
        }
        if state.deleted {
            return Err(Error::state(format!(
                "'{}' object {} is already deleted",
                self.table_name(),
                state.id
            )));
        }

        let sql = self.delete_sql();
        let id = state.id;
        store.gateway().access(|conn| {
            conn.execute(&sql, [id])?;
            Ok(())
        })?;

        state.deleted = true;
        if state.registered {
            store.cache().unregister(self.table_name(), id, self as *const DbObject);
            state.registered = false;
        }
        debug!(table = self.table_name(), id, "deleted object");
        Ok(())
    }

    pub(crate) fn mark_registered(&self) {
        self.lock().registered = true;
    }

    // ========== Introspection ==========

    pub fn column_names(&self) -> Result<Vec<String>> {
        self.store()?.column_names_for_table(self.table_name())
    }

    pub fn has_column(&self, column_name: &str) -> Result<bool> {
        self.store()?.table_has_column(self.table_name(), column_name)
    }

    /// Column form of a property name, or None if no such column exists
    pub fn column_name_for_property(&self, property_name: &str) -> Result<Option<String>> {
        let column = naming::column_name_for_property(property_name);
        Ok(self.has_column(&column)?.then_some(column))
    }

    /// Property form of a column name, or None if no such column exists
    pub fn property_name_for_column(&self, column_name: &str) -> Result<Option<String>> {
        Ok(self
            .has_column(column_name)?
            .then(|| naming::property_name_for_column(column_name)))
    }

    /// The CREATE TABLE statement for this object's table
    pub fn create_table_sql(&self) -> Result<String> {
        self.store()?.create_table_sql(self.table_name())
    }

    // ========== Dictionary representation ==========

    /// Merged view of loaded and pending values (pending wins), loading
    /// first if required
    pub fn dictionary_representation(&self) -> Result<HashMap<String, Value>> {
        let mut state = self.lock();
        if state.has_been_created() && !state.loaded && !state.deleted {
            self.load_locked(&mut state)?;
        }
        let mut dict: HashMap<String, Value> = state
            .loaded_columns
            .iter()
            .map(|(k, v)| (naming::dictionary_key_for_column(k), v.clone()))
            .collect();
        for (k, v) in &state.pending_changes {
            dict.insert(naming::dictionary_key_for_column(k), v.clone());
        }
        Ok(dict)
    }

    /// Only the modified columns
    pub fn unsaved_dictionary_representation(&self) -> HashMap<String, Value> {
        self.lock()
            .pending_changes
            .iter()
            .map(|(k, v)| (naming::dictionary_key_for_column(k), v.clone()))
            .collect()
    }

    // ========== SQL builders ==========

    pub fn load_sql(&self) -> String {
        format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?1",
            self.table_name(),
            self.primary_key_name()
        )
    }

    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
            self.table_name(),
            self.primary_key_name()
        )
    }

    /// The INSERT this object's `create` would run, with its bound
    /// arguments. Columns appear in sorted order for determinism.
    pub fn create_sql_with_arguments(&self) -> (String, Vec<Value>) {
        Self::create_sql_locked(&self.class, &self.lock())
    }

    /// The UPDATE this object's `save` would run, touching exactly the
    /// changed columns. Fails when nothing is pending or no id is assigned.
    pub fn save_sql_with_arguments(&self) -> Result<(String, Vec<Value>)> {
        let state = self.lock();
        if !state.has_been_created() {
            return Err(Error::state("object has no row id to save against"));
        }
        if state.pending_changes.is_empty() {
            return Err(Error::state("object has no unsaved changes"));
        }
        Ok(Self::save_sql_locked(&self.class, &state))
    }

    fn sorted_pending(state: &ObjectState) -> Vec<(&String, &Value)> {
        let mut pairs: Vec<_> = state.pending_changes.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }

    fn create_sql_locked(class: &ObjectClass, state: &ObjectState) -> (String, Vec<Value>) {
        let pairs = Self::sorted_pending(state);
        if pairs.is_empty() {
            return (format!("INSERT INTO \"{}\" DEFAULT VALUES", class.table_name()), Vec::new());
        }
        let columns: Vec<String> = pairs.iter().map(|(c, _)| format!("\"{c}\"")).collect();
        let binds: Vec<String> = (1..=pairs.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            class.table_name(),
            columns.join(", "),
            binds.join(", ")
        );
        let arguments = pairs.into_iter().map(|(_, v)| v.clone()).collect();
        (sql, arguments)
    }

    fn save_sql_locked(class: &ObjectClass, state: &ObjectState) -> (String, Vec<Value>) {
        let pairs = Self::sorted_pending(state);
        let assignments: Vec<String> = pairs
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("\"{}\" = ?{}", c, i + 1))
            .collect();
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?{}",
            class.table_name(),
            assignments.join(", "),
            class.primary_key(),
            pairs.len() + 1
        );
        let mut arguments: Vec<Value> = pairs.into_iter().map(|(_, v)| v.clone()).collect();
        arguments.push(Value::Integer(state.id));
        (sql, arguments)
    }
}

impl Drop for DbObject {
    fn drop(&mut self) {
        let ptr: *const DbObject = self;
        let Some(store) = self.store.get() else { return };
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.registered {
            store.cache().unregister(self.class.table_name(), state.id, ptr);
        }
    }
}

impl fmt::Debug for DbObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DbObject")
            .field("type", &self.class.type_name())
            .field("table", &self.class.table_name())
            .field("id", &state.id)
            .field("loaded", &state.loaded)
            .field("deleted", &state.deleted)
            .field("pending", &state.pending_changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_class() -> Arc<ObjectClass> {
        Arc::new(ObjectClass::new("Person", "people"))
    }

    #[test]
    fn test_fresh_object_state() {
        let obj = DbObject::new(people_class());
        assert_eq!(obj.object_id(), OBJECT_ID_NOT_YET_ASSIGNED);
        assert!(!obj.has_been_created());
        assert!(!obj.has_been_deleted());
        assert!(!obj.needs_loading());
        assert!(!obj.has_unsaved_changes());
    }

    #[test]
    fn test_staging_and_revert() {
        let obj = DbObject::new(people_class());
        obj.set_value_for_column("name", "ada").unwrap();
        obj.set_value_for_column("age", 36).unwrap();
        assert!(obj.has_unsaved_changes());
        assert_eq!(obj.value_for_column("name").unwrap(), Value::Text("ada".into()));

        obj.revert();
        assert!(!obj.has_unsaved_changes());
        // No store attached, so the value falls back to null
        assert_eq!(obj.value_for_column("name").unwrap(), Value::Null);
    }

    #[test]
    fn test_load_before_id_is_invalid_state() {
        let obj = DbObject::new(people_class());
        let err = obj.load().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_save_without_store_fails() {
        let obj = DbObject::with_id(people_class(), 3);
        let err = obj.save().unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_create_sql_covers_pending_columns_sorted() {
        let obj = DbObject::new(people_class());
        obj.set_value_for_column("name", "ada").unwrap();
        obj.set_value_for_column("age", 36).unwrap();

        let (sql, args) = obj.create_sql_with_arguments();
        assert_eq!(sql, "INSERT INTO \"people\" (\"age\", \"name\") VALUES (?1, ?2)");
        assert_eq!(args, vec![Value::Integer(36), Value::Text("ada".into())]);
    }

    #[test]
    fn test_create_sql_without_pending_uses_defaults() {
        let obj = DbObject::new(people_class());
        let (sql, args) = obj.create_sql_with_arguments();
        assert_eq!(sql, "INSERT INTO \"people\" DEFAULT VALUES");
        assert!(args.is_empty());
    }

    #[test]
    fn test_save_sql_touches_only_changed_columns() {
        let obj = DbObject::with_id(people_class(), 9);
        obj.set_value_for_column("name", "grace").unwrap();

        let (sql, args) = obj.save_sql_with_arguments().unwrap();
        assert_eq!(sql, "UPDATE \"people\" SET \"name\" = ?1 WHERE \"_ROWID_\" = ?2");
        assert_eq!(args, vec![Value::Text("grace".into()), Value::Integer(9)]);
    }

    #[test]
    fn test_load_and_delete_sql() {
        let obj = DbObject::new(Arc::new(
            ObjectClass::new("Person", "people").with_primary_key("person_id"),
        ));
        assert_eq!(obj.load_sql(), "SELECT * FROM \"people\" WHERE \"person_id\" = ?1");
        assert_eq!(obj.delete_sql(), "DELETE FROM \"people\" WHERE \"person_id\" = ?1");
    }

    #[test]
    fn test_unsaved_dictionary_representation() {
        let obj = DbObject::new(people_class());
        obj.set_value_for_column("pet_name", "mr bigglesworth").unwrap();
        let dict = obj.unsaved_dictionary_representation();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict["pet_name"], Value::Text("mr bigglesworth".into()));
    }
}
