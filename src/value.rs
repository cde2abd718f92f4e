//! Column value domain
//!
//! Every column value belongs to exactly one of five storage domains:
//! null, integer, real, text, or blob. Coercion between a stored domain and
//! a requested primitive either succeeds exactly or fails with
//! [`Error::TypeMismatch`] - values are never silently truncated.

use crate::{Error, Result};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;

/// A single column value in one of SQLite's five storage domains
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// The five column storage domains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl ValueType {
    /// The SQLite type keyword for this domain (as PRAGMA table_info reports)
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Null => "NULL",
            ValueType::Integer => "INTEGER",
            ValueType::Real => "REAL",
            ValueType::Text => "TEXT",
            ValueType::Blob => "BLOB",
        }
    }

    /// Map a declared column type to its storage domain, following SQLite's
    /// type affinity rules (NUMERIC affinity maps to Real).
    pub fn from_declared_type(decl: &str) -> ValueType {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            ValueType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ValueType::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            ValueType::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ValueType::Real
        } else {
            ValueType::Real
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Value {
    /// The storage domain this value belongs to
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Real(_) => ValueType::Real,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    /// The column type keyword a column would need to store this value
    pub fn required_column_type(&self) -> &'static str {
        self.value_type().as_str()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn mismatch(&self, column: &str, requested: &'static str) -> Error {
        Error::TypeMismatch {
            column: column.to_string(),
            requested,
            actual: self.value_type().as_str(),
        }
    }

    /// Coerce to bool: any integer, nonzero is true
    pub fn as_bool(&self, column: &str) -> Result<bool> {
        match self {
            Value::Integer(i) => Ok(*i != 0),
            other => Err(other.mismatch(column, "bool")),
        }
    }

    /// Coerce to i64: integers only
    pub fn as_i64(&self, column: &str) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(other.mismatch(column, "integer")),
        }
    }

    /// Coerce to f64: reals, or integers widened losslessly
    pub fn as_f64(&self, column: &str) -> Result<f64> {
        match self {
            Value::Real(r) => Ok(*r),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(other.mismatch(column, "real")),
        }
    }

    /// Borrow as text
    pub fn as_str(&self, column: &str) -> Result<&str> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(other.mismatch(column, "text")),
        }
    }

    /// Borrow as binary data
    pub fn as_blob(&self, column: &str) -> Result<&[u8]> {
        match self {
            Value::Blob(b) => Ok(b),
            other => Err(other.mismatch(column, "blob")),
        }
    }

    /// Build a Value from a raw SQLite cell. Text holding invalid UTF-8 is
    /// a conversion failure, never replaced or truncated.
    pub(crate) fn from_sql_ref(r: ValueRef<'_>) -> FromSqlResult<Value> {
        Ok(match r {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(_) => Value::Text(r.as_str()?.to_string()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Value::from_sql_ref(value)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}
