//! Identity cache - one live object per (table, id)
//!
//! Entries hold weak references, so the cache never keeps objects alive.
//! A dead entry is indistinguishable from a miss: lookups prune it and the
//! caller constructs a fresh instance. An entry may die concurrently with a
//! lookup, so everything here runs under the cache's own lock, independent
//! of the engine gateway.

use crate::object::{DbObject, ObjectId};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Per-table weak mapping from row id to the live object for that row
pub struct IdentityCache {
    entries: Mutex<HashMap<(String, ObjectId), Weak<DbObject>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, ObjectId), Weak<DbObject>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the live object for (table, id), if any. A dead entry is
    /// pruned and treated as a miss, never an error.
    pub fn lookup(&self, table: &str, id: ObjectId) -> Option<Arc<DbObject>> {
        let mut entries = self.lock();
        let key = (table.to_string(), id);
        match entries.get(&key) {
            Some(weak) => match weak.upgrade() {
                Some(live) => Some(live),
                None => {
                    entries.remove(&key);
                    None
                }
            },
            None => None,
        }
    }

    /// Insert a weak entry for the object. A still-live existing entry for
    /// the same key is a duplicate identity and reported as a fault; a dead
    /// one is silently replaced.
    pub fn register(&self, table: &str, id: ObjectId, object: Weak<DbObject>) -> Result<()> {
        let mut entries = self.lock();
        let key = (table.to_string(), id);
        if let Some(existing) = entries.get(&key) {
            if existing.upgrade().is_some() {
                return Err(Error::state(format!(
                    "duplicate live object for table '{table}' id {id}"
                )));
            }
        }
        entries.insert(key, object);
        Ok(())
    }

    /// Atomic lookup-or-construct: returns the live object for (table, id),
    /// building and registering one via `make` on a miss. Holding the lock
    /// across both halves keeps concurrent callers from racing duplicate
    /// identities into existence.
    pub fn lookup_or_register(
        &self,
        table: &str,
        id: ObjectId,
        make: impl FnOnce() -> Arc<DbObject>,
    ) -> Arc<DbObject> {
        let mut entries = self.lock();
        let key = (table.to_string(), id);
        if let Some(weak) = entries.get(&key) {
            if let Some(live) = weak.upgrade() {
                return live;
            }
        }
        let fresh = make();
        entries.insert(key, Arc::downgrade(&fresh));
        fresh
    }

    /// Remove the entry for (table, id) if it is dead or points at
    /// `object`. The pointer check keeps a drop-path unregister from
    /// evicting a newer live object that reclaimed the same key. Safe to
    /// call from the object's drop path.
    pub fn unregister(&self, table: &str, id: ObjectId, object: *const DbObject) {
        let mut entries = self.lock();
        let key = (table.to_string(), id);
        if let Some(weak) = entries.get(&key) {
            if weak.upgrade().is_none() || std::ptr::eq(weak.as_ptr(), object) {
                entries.remove(&key);
            }
        }
    }

    /// Number of entries, live or dead (for diagnostics)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectClass;

    fn sample_object() -> Arc<DbObject> {
        DbObject::new(Arc::new(ObjectClass::generic("people")))
    }

    #[test]
    fn test_lookup_returns_registered_instance() {
        let cache = IdentityCache::new();
        let obj = sample_object();
        cache.register("people", 1, Arc::downgrade(&obj)).unwrap();

        let found = cache.lookup("people", 1).unwrap();
        assert!(Arc::ptr_eq(&found, &obj));
        assert!(cache.lookup("people", 2).is_none());
        assert!(cache.lookup("pets", 1).is_none());
    }

    #[test]
    fn test_dead_entry_is_a_miss() {
        let cache = IdentityCache::new();
        let obj = sample_object();
        cache.register("people", 1, Arc::downgrade(&obj)).unwrap();
        drop(obj);

        assert!(cache.lookup("people", 1).is_none());
        // Pruned on lookup
        assert!(cache.is_empty());
    }

    #[test]
    fn test_duplicate_live_registration_is_a_fault() {
        let cache = IdentityCache::new();
        let first = sample_object();
        cache.register("people", 1, Arc::downgrade(&first)).unwrap();

        let second = sample_object();
        let err = cache.register("people", 1, Arc::downgrade(&second)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_dead_entry_replaced_on_register() {
        let cache = IdentityCache::new();
        let first = sample_object();
        cache.register("people", 1, Arc::downgrade(&first)).unwrap();
        drop(first);

        let second = sample_object();
        cache.register("people", 1, Arc::downgrade(&second)).unwrap();
        let found = cache.lookup("people", 1).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[test]
    fn test_unregister_spares_newer_entry() {
        let cache = IdentityCache::new();
        let old = sample_object();
        let old_ptr = Arc::as_ptr(&old);
        cache.register("people", 1, Arc::downgrade(&old)).unwrap();

        let newer = sample_object();
        drop(old);
        cache.register("people", 1, Arc::downgrade(&newer)).unwrap();

        // Stale unregister from the old object's release path must not
        // evict the newer live entry.
        cache.unregister("people", 1, old_ptr);
        assert!(cache.lookup("people", 1).is_some());

        cache.unregister("people", 1, Arc::as_ptr(&newer));
        assert!(cache.lookup("people", 1).is_none());
    }

    #[test]
    fn test_lookup_or_register_is_stable_while_live() {
        let cache = IdentityCache::new();
        let first = cache.lookup_or_register("people", 7, sample_object);
        let again = cache.lookup_or_register("people", 7, || panic!("must not construct"));
        assert!(Arc::ptr_eq(&first, &again));
    }
}
