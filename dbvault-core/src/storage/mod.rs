/*!
Storage access for the database being protected.

This module defines the storage abstraction (port) the backup and recovery
engines are written against, and the concrete adapters that implement it. The
engines never talk to a database driver directly, so adding a new backend
means implementing [`StorageAccess`] and nothing else.
*/

#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::codec::quote_identifier;
use crate::{Result, VaultError};

/// A single column value as read from or written to the database
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

/// One row of column values, in column order
pub type Row = Vec<SqlValue>;

/// Abstraction over the protected database
///
/// Implementations must be usable from several threads; the engines share
/// one handle behind an `Arc`. Transaction calls apply to the single session
/// the handle represents.
#[cfg_attr(test, mockall::automock)]
pub trait StorageAccess: Send + Sync {
    /// Execute a statement, returning the number of affected rows
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query and collect every row
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Start a transaction
    fn begin(&self) -> Result<()>;

    /// Commit the open transaction
    fn commit(&self) -> Result<()>;

    /// Roll back the open transaction
    fn rollback(&self) -> Result<()>;

    /// Names of all user tables, in a stable order
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Statement(s) that recreate the table, including its indexes
    ///
    /// Returns [`VaultError::NotFound`] for unknown tables.
    fn create_definition(&self, table: &str) -> Result<String>;

    /// Writable columns of `table`, in the order [`fetch_page`] returns them
    ///
    /// Computed or hidden columns are left out so the dumped rows can be
    /// inserted back with an explicit column list.
    ///
    /// [`fetch_page`]: StorageAccess::fetch_page
    fn insert_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Rows `offset..offset + limit` of `table` in a stable order
    ///
    /// Only the columns named by [`StorageAccess::insert_columns`] are read.
    fn fetch_page(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Row>>;

    /// Toggle referential-integrity enforcement for the session
    fn set_integrity_checks(&self, enabled: bool) -> Result<()>;

    /// Cheap connectivity check
    fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).map(|_| ())
    }

    /// Number of rows currently in `table`
    fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let rows = self.query(&sql, &[])?;
        match rows.first().and_then(|row| row.first()) {
            Some(SqlValue::Integer(count)) if *count >= 0 => Ok(*count as u64),
            other => Err(VaultError::storage(format!(
                "unexpected row count result for {table}: {other:?}"
            ))),
        }
    }
}
