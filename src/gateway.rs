//! Engine gateway - serialized access to the single SQLite handle
//!
//! All engine work goes through one of the access blocks on [`Gateway`].
//! The gateway owns the only connection and funnels every caller through a
//! single lock, so engine operations never interleave even when callers
//! arrive on multiple threads.

use crate::Result;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Owns the sole SQLite connection and serializes all access to it
pub struct Gateway {
    conn: Mutex<Connection>,
}

impl Gateway {
    /// Open a database file (creates if it doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with the engine handle, serialized against all other access
    pub fn access<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction. `f` receives a rollback
    /// flag; setting it rolls the transaction back instead of committing.
    /// An error from `f` also rolls back.
    pub fn access_with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection, &mut bool) -> Result<T>,
    ) -> Result<T> {
        self.transactional(TransactionBehavior::Immediate, f)
    }

    /// Same as [`access_with_transaction`](Self::access_with_transaction)
    /// but the transaction is deferred, acquiring its lock lazily. Suited to
    /// read-mostly blocks.
    pub fn access_with_deferred_transaction<T>(
        &self,
        f: impl FnOnce(&Connection, &mut bool) -> Result<T>,
    ) -> Result<T> {
        self.transactional(TransactionBehavior::Deferred, f)
    }

    fn transactional<T>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Connection, &mut bool) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(behavior)?;
        let mut rollback = false;
        match f(&tx, &mut rollback) {
            Ok(value) => {
                if rollback {
                    tx.rollback()?;
                } else {
                    tx.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                // Drop of an uncommitted Transaction rolls back, but do it
                // explicitly. A rollback failure must not mask the
                // original error.
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_table() -> Gateway {
        let gw = Gateway::open_in_memory().unwrap();
        gw.access(|conn| {
            conn.execute("CREATE TABLE t (n INTEGER)", [])?;
            Ok(())
        })
        .unwrap();
        gw
    }

    fn count(gw: &Gateway) -> i64 {
        gw.access(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?;
            Ok(n)
        })
        .unwrap()
    }

    #[test]
    fn test_transaction_commits() {
        let gw = gateway_with_table();
        gw.access_with_transaction(|conn, _rollback| {
            conn.execute("INSERT INTO t (n) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&gw), 1);
    }

    #[test]
    fn test_rollback_flag_discards_writes() {
        let gw = gateway_with_table();
        gw.access_with_transaction(|conn, rollback| {
            conn.execute("INSERT INTO t (n) VALUES (1)", [])?;
            *rollback = true;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&gw), 0);
    }

    #[test]
    fn test_error_rolls_back() {
        let gw = gateway_with_table();
        let result: crate::Result<()> = gw.access_with_transaction(|conn, _rollback| {
            conn.execute("INSERT INTO t (n) VALUES (1)", [])?;
            conn.execute("INSERT INTO nonexistent (n) VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count(&gw), 0);
    }

    #[test]
    fn test_closure_error_survives_rollback() {
        let gw = gateway_with_table();
        let err = gw
            .access_with_transaction(|conn, _rollback| -> crate::Result<()> {
                conn.execute("INSERT INTO t (n) VALUES (1)", [])?;
                Err(crate::Error::InvalidState("stop here".into()))
            })
            .unwrap_err();
        // The returned error is the closure's own, not a rollback artifact
        assert!(matches!(err, crate::Error::InvalidState(msg) if msg == "stop here"));
        assert_eq!(count(&gw), 0);
    }

    #[test]
    fn test_deferred_transaction_commits() {
        let gw = gateway_with_table();
        gw.access_with_deferred_transaction(|conn, _rollback| {
            conn.execute("INSERT INTO t (n) VALUES (2)", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&gw), 1);
    }

    #[test]
    fn test_serialized_across_threads() {
        let gw = std::sync::Arc::new(gateway_with_table());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gw = gw.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    gw.access(|conn| {
                        conn.execute("INSERT INTO t (n) VALUES (1)", [])?;
                        Ok(())
                    })
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count(&gw), 100);
    }
}
