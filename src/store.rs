//! Data store - the composition root applications talk to
//!
//! Owns the engine gateway, migration engine, identity cache, class
//! registry and schema cache for one SQLite file. A store becomes usable
//! only after `load_and_perform_any_required_migrations` succeeds; all
//! object access before that fails. Structural identifiers (tables,
//! order-by columns) are validated against the engine's own schema
//! introspection, never trusted from caller input.

use crate::cache::IdentityCache;
use crate::gateway::Gateway;
use crate::migration::{METADATA_TABLE, Migrator};
use crate::object::{DbObject, OBJECT_ID_INVALID, OBJECT_ID_NOT_YET_ASSIGNED, ObjectClass, ObjectId};
use crate::query::Query;
use crate::value::{Value, ValueType};
use crate::{Error, Result};
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// One column of a table, as reported by the engine's schema introspection
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: Option<String>,
    pub primary_key: bool,
}

/// Object-based wrapper around one SQLite file's tables
pub struct DataStore {
    path: PathBuf,
    gateway: Gateway,
    loaded: AtomicBool,
    migrator: Mutex<Migrator>,
    classes: Mutex<HashMap<String, Arc<ObjectClass>>>,
    schema: Mutex<HashMap<String, Vec<ColumnInfo>>>,
    cache: IdentityCache,
}

impl DataStore {
    /// Open a database file (creates if it doesn't exist). The store must
    /// load before any object access.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let gateway = Gateway::open(&path)?;
        Ok(Arc::new(Self::with_gateway(path, gateway)))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let gateway = Gateway::open_in_memory()?;
        Ok(Arc::new(Self::with_gateway(PathBuf::from(":memory:"), gateway)))
    }

    fn with_gateway(path: PathBuf, gateway: Gateway) -> Self {
        Self {
            path,
            gateway,
            loaded: AtomicBool::new(false),
            migrator: Mutex::new(Migrator::new()),
            classes: Mutex::new(HashMap::new()),
            schema: Mutex::new(HashMap::new()),
            cache: IdentityCache::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialized access to the underlying engine
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub(crate) fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    fn lock_migrator(&self) -> MutexGuard<'_, Migrator> {
        self.migrator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_classes(&self) -> MutexGuard<'_, HashMap<String, Arc<ObjectClass>>> {
        self.classes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_schema(&self) -> MutexGuard<'_, HashMap<String, Vec<ColumnInfo>>> {
        self.schema.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========== Loading & migrations ==========

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        Err(Error::state("data store has not been loaded"))
    }

    /// Register a migration script. Scripts run in registration order;
    /// only valid before loading.
    pub fn register_migration(
        &self,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Result<()> {
        self.lock_migrator().register(name, sql)
    }

    /// Register a migration script from a file
    pub fn register_migration_file(&self, path: &Path) -> Result<()> {
        self.lock_migrator().register_file(path)
    }

    /// True if any migrations have been registered
    pub fn migrations_enabled(&self) -> bool {
        self.lock_migrator().migrations_enabled()
    }

    /// True if fewer scripts have been applied than registered
    pub fn requires_migration(&self) -> Result<bool> {
        self.lock_migrator().requires_migration(&self.gateway)
    }

    /// Load the store, applying any pending migrations and refreshing the
    /// schema cache. Required before accessing any objects. Succeeds only
    /// if every pending script applied.
    pub fn load_and_perform_any_required_migrations(&self) -> Result<()> {
        self.gateway.access(|conn| Migrator::ensure_metadata_table(conn))?;
        self.lock_migrator().run_pending(&self.gateway)?;
        self.refresh_schema_cache()?;
        self.loaded.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "data store loaded");
        Ok(())
    }

    fn refresh_schema_cache(&self) -> Result<()> {
        let tables: Vec<String> = self.gateway.access(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })?;

        let mut fresh = HashMap::with_capacity(tables.len());
        for table in tables {
            let columns = self.gateway.access(|conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
                let infos = stmt
                    .query_map([], |row| {
                        Ok(ColumnInfo {
                            name: row.get(1)?,
                            declared_type: row.get(2)?,
                            primary_key: row.get::<_, i64>(5)? != 0,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<ColumnInfo>>>()?;
                Ok(infos)
            })?;
            fresh.insert(table, columns);
        }
        *self.lock_schema() = fresh;
        Ok(())
    }

    // ========== Metadata ==========

    /// Read a value from the reserved key/value metadata table
    pub fn metadata_value(&self, key: &str) -> Result<Option<Value>> {
        self.gateway.access(|conn| {
            Migrator::ensure_metadata_table(conn)?;
            let value = conn
                .query_row(
                    &format!("SELECT value FROM \"{METADATA_TABLE}\" WHERE key = ?1"),
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Write a value into the reserved key/value metadata table
    pub fn set_metadata_value(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.gateway.access(|conn| {
            Migrator::ensure_metadata_table(conn)?;
            conn.execute(
                &format!("INSERT OR REPLACE INTO \"{METADATA_TABLE}\" (key, value) VALUES (?1, ?2)"),
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
    }

    // ========== Schema introspection ==========

    /// Names of the tables in the store (sorted)
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        let mut names: Vec<String> = self.lock_schema().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.lock_schema().contains_key(table))
    }

    fn validate_table(&self, table: &str) -> Result<()> {
        if self.has_table(table)? {
            return Ok(());
        }
        Err(Error::state(format!("no table named '{table}'")))
    }

    /// Column names for a table, in declaration order
    pub fn column_names_for_table(&self, table: &str) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        let schema = self.lock_schema();
        let columns = schema
            .get(table)
            .ok_or_else(|| Error::state(format!("no table named '{table}'")))?;
        Ok(columns.iter().map(|c| c.name.clone()).collect())
    }

    pub fn table_has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self.column_names_for_table(table)?.iter().any(|c| c == column))
    }

    /// Storage domain of a column's declared type, or None for an unknown
    /// column
    pub fn column_type_for_table(&self, table: &str, column: &str) -> Result<Option<ValueType>> {
        self.ensure_loaded()?;
        let schema = self.lock_schema();
        let columns = schema
            .get(table)
            .ok_or_else(|| Error::state(format!("no table named '{table}'")))?;
        Ok(columns.iter().find(|c| c.name == column).map(|c| {
            c.declared_type
                .as_deref()
                .map(ValueType::from_declared_type)
                .unwrap_or(ValueType::Blob)
        }))
    }

    /// The CREATE TABLE statement the engine holds for a table
    pub fn create_table_sql(&self, table: &str) -> Result<String> {
        self.validate_table(table)?;
        self.gateway.access(|conn| {
            let sql: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()?;
            sql.ok_or_else(|| Error::state(format!("no table named '{table}'")))
        })
    }

    /// Number of rows in a table
    pub fn number_of_objects_in_table(&self, table: &str) -> Result<i64> {
        self.validate_table(table)?;
        self.gateway.access(|conn| {
            let count =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
            Ok(count)
        })
    }

    // ========== Class association ==========

    /// Record the object class for its declared table. Lookups for that
    /// table thereafter vend objects carrying this class.
    pub fn associate_object_class(&self, class: ObjectClass) {
        self.lock_classes().insert(class.table_name().to_string(), Arc::new(class));
    }

    /// The class for a table: the associated one, or the generic default
    pub fn object_class_for_table(&self, table: &str) -> Arc<ObjectClass> {
        self.lock_classes()
            .get(table)
            .cloned()
            .unwrap_or_else(|| Arc::new(ObjectClass::generic(table)))
    }

    /// Type names of all associated classes
    pub fn object_class_names(&self) -> Vec<String> {
        self.lock_classes().values().map(|c| c.type_name().to_string()).collect()
    }

    // ========== Object lookup ==========

    /// The live object for (table, id). While a prior instance is still
    /// alive this returns the same instance; once all owners release it, a
    /// fresh instance is constructed and re-fetches the row's current
    /// persisted state on first access.
    pub fn object_from_table(self: &Arc<Self>, table: &str, id: ObjectId) -> Result<Arc<DbObject>> {
        self.validate_table(table)?;
        if id == OBJECT_ID_INVALID || id == OBJECT_ID_NOT_YET_ASSIGNED {
            return Err(Error::state(format!("invalid object id {id} for table '{table}'")));
        }
        let class = self.object_class_for_table(table);
        Ok(self.cache.lookup_or_register(table, id, || {
            let object = DbObject::with_store(self.clone(), class, id);
            object.mark_registered();
            object
        }))
    }

    /// Objects for a list of ids, in the same order
    pub fn objects_from_table_with_ids(
        self: &Arc<Self>,
        table: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<Arc<DbObject>>> {
        ids.iter().map(|id| self.object_from_table(table, *id)).collect()
    }

    /// A fresh, uncreated object bound to this store. Call `create` (or
    /// `insert_object`) to give it a row.
    pub fn new_object_in_table(self: &Arc<Self>, table: &str) -> Result<Arc<DbObject>> {
        self.validate_table(table)?;
        let class = self.object_class_for_table(table);
        Ok(DbObject::with_store(self.clone(), class, OBJECT_ID_NOT_YET_ASSIGNED))
    }

    // ========== Querying ==========

    /// Ids of the rows matching a query, honoring its predicate and order
    pub fn object_ids_matching(&self, query: &Query) -> Result<Vec<ObjectId>> {
        let table = query.table();
        self.validate_table(table)?;
        let class = self.object_class_for_table(table);
        if let Some((column, _)) = query.order_column() {
            if column != class.primary_key() && !self.table_has_column(table, column)? {
                return Err(Error::state(format!(
                    "cannot order by unknown column '{column}' in table '{table}'"
                )));
            }
        }

        let sql = query.sql_selecting(&format!("\"{}\"", class.primary_key()));
        self.gateway.access(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<ObjectId>>>()?;
            Ok(ids)
        })
    }

    /// Live objects for the rows matching a query
    pub fn objects_matching(self: &Arc<Self>, query: &Query) -> Result<Vec<Arc<DbObject>>> {
        let ids = self.object_ids_matching(query)?;
        self.objects_from_table_with_ids(query.table(), &ids)
    }

    pub fn object_ids_from_table_where(
        &self,
        table: &str,
        where_clause: Option<&str>,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<ObjectId>> {
        let mut query = Query::new(table);
        if let Some(w) = where_clause {
            query = query.filter(w);
        }
        if let Some(column) = order_by {
            query = query.order_by(column, ascending);
        }
        self.object_ids_matching(&query)
    }

    pub fn objects_from_table_where(
        self: &Arc<Self>,
        table: &str,
        where_clause: Option<&str>,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<Arc<DbObject>>> {
        let ids = self.object_ids_from_table_where(table, where_clause, order_by, ascending)?;
        self.objects_from_table_with_ids(table, &ids)
    }

    /// Textual search: objects whose column contains the given string
    pub fn objects_containing_string(
        self: &Arc<Self>,
        table: &str,
        needle: &str,
        column: &str,
    ) -> Result<Vec<Arc<DbObject>>> {
        self.validate_table(table)?;
        if !self.table_has_column(table, column)? {
            return Err(Error::state(format!(
                "no column '{column}' in table '{table}' to search"
            )));
        }
        let class = self.object_class_for_table(table);
        let pattern = format!("%{needle}%");
        let sql = format!(
            "SELECT \"{}\" FROM \"{}\" WHERE \"{}\" LIKE ?1",
            class.primary_key(),
            table,
            column
        );
        let ids = self.gateway.access(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([&pattern], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<ObjectId>>>()?;
            Ok(ids)
        })?;
        self.objects_from_table_with_ids(table, &ids)
    }

    // ========== Insertion & deletion ==========

    fn adopt(self: &Arc<Self>, object: &Arc<DbObject>) -> Result<()> {
        match object.data_store() {
            None => object.associate_with(self),
            Some(existing) if Arc::ptr_eq(existing, self) => Ok(()),
            Some(_) => Err(Error::state("object belongs to a different data store")),
        }
    }

    /// Associate the object with this store if needed, then create it (or
    /// save it if it already has a row). Returns the object's id.
    pub fn insert_object(self: &Arc<Self>, object: &Arc<DbObject>) -> Result<ObjectId> {
        self.ensure_loaded()?;
        self.adopt(object)?;
        if object.has_been_created() {
            object.save()?;
            Ok(object.object_id())
        } else {
            object.create()
        }
    }

    pub fn insert_objects(self: &Arc<Self>, objects: &[Arc<DbObject>]) -> Result<Vec<ObjectId>> {
        objects.iter().map(|o| self.insert_object(o)).collect()
    }

    /// Delete the object's row from this store
    pub fn delete_object(self: &Arc<Self>, object: &Arc<DbObject>) -> Result<()> {
        self.ensure_loaded()?;
        self.adopt(object)?;
        object.delete()
    }

    pub fn delete_objects(self: &Arc<Self>, objects: &[Arc<DbObject>]) -> Result<()> {
        for object in objects {
            self.delete_object(object)?;
        }
        Ok(())
    }
}
