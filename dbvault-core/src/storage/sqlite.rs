/*!
SQLite storage adapter implementation.
*/

use super::{Row, SqlValue, StorageAccess};
use crate::codec::quote_identifier;
use crate::{Result, VaultError};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

fn storage_error(e: rusqlite::Error) -> VaultError {
    VaultError::storage(e.to_string())
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

/// SQLite storage adapter
///
/// Wraps a single connection; every call runs on that one session, so a
/// transaction started with [`StorageAccess::begin`] covers all statements
/// executed until commit or rollback.
///
/// # Example
/// ```rust
/// use dbvault_core::storage::{sqlite::SqliteAccess, StorageAccess};
///
/// let db = SqliteAccess::open_in_memory()?;
/// db.execute("CREATE TABLE t (id INTEGER)", &[])?;
/// assert_eq!(db.list_tables()?, vec!["t".to_string()]);
/// # Ok::<(), dbvault_core::VaultError>(())
/// ```
#[derive(Debug)]
pub struct SqliteAccess {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteAccess {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            VaultError::storage(format!("Failed to open database {}: {}", path.display(), e))
        })?;
        debug!("Opened SQLite database {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Lock("SQLite connection mutex poisoned".to_string()))
    }
}

fn text_column(conn: &Connection, sql: &str, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(storage_error)?;
    let values = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(storage_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_error)?;
    Ok(values)
}

/// Stored, non-generated columns in declaration order
fn writable_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let columns = text_column(
        conn,
        "SELECT name FROM pragma_table_xinfo(?1) WHERE hidden = 0 ORDER BY cid",
        table,
    )?;
    if columns.is_empty() {
        return Err(VaultError::not_found(format!("table {table}")));
    }
    Ok(columns)
}

/// `ORDER BY` target giving a total order over the rows of `table`
///
/// Rowid tables are walked by rowid. `WITHOUT ROWID` tables have no rowid,
/// so their (non-null) primary key columns are used instead.
fn page_order(conn: &Connection, table: &str) -> Result<String> {
    let without_rowid: bool = conn
        .query_row(
            "SELECT wr FROM pragma_table_list WHERE name = ?1 AND schema = 'main'",
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_error)?
        .unwrap_or(false);
    if !without_rowid {
        return Ok("rowid".to_string());
    }

    let key = text_column(
        conn,
        "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
        table,
    )?;
    Ok(key
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<_>>()
        .join(", "))
}

impl StorageAccess for SqliteAccess {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let conn = self.conn()?;
        let affected = conn
            .execute(sql, params_from_iter(params.iter().map(to_value)))
            .map_err(storage_error)?;
        Ok(affected as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(storage_error)?;
        let columns = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_value)))
            .map_err(storage_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage_error)? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(from_value_ref(row.get_ref(i).map_err(storage_error)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn begin(&self) -> Result<()> {
        self.conn()?.execute_batch("BEGIN").map_err(storage_error)
    }

    fn commit(&self) -> Result<()> {
        self.conn()?.execute_batch("COMMIT").map_err(storage_error)
    }

    fn rollback(&self) -> Result<()> {
        self.conn()?.execute_batch("ROLLBACK").map_err(storage_error)
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
                 ORDER BY name",
            )
            .map_err(storage_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)?;
        Ok(names)
    }

    fn create_definition(&self, table: &str) -> Result<String> {
        let conn = self.conn()?;
        let create: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?
            .ok_or_else(|| VaultError::not_found(format!("table {table}")))?;

        let indexes = text_column(
            &conn,
            "SELECT sql FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
            table,
        )?;

        let mut definition = create;
        for index in indexes {
            definition.push_str(";\n");
            definition.push_str(&index);
        }
        Ok(definition)
    }

    fn insert_columns(&self, table: &str) -> Result<Vec<String>> {
        writable_columns(&*self.conn()?, table)
    }

    fn fetch_page(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let (columns, order) = {
            let conn = self.conn()?;
            (writable_columns(&conn, table)?, page_order(&conn, table)?)
        };
        let selected = columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {selected} FROM {} ORDER BY {order} LIMIT ?1 OFFSET ?2",
            quote_identifier(table)
        );
        self.query(
            &sql,
            &[SqlValue::Integer(limit as i64), SqlValue::Integer(offset as i64)],
        )
    }

    fn set_integrity_checks(&self, enabled: bool) -> Result<()> {
        let pragma = if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };
        self.conn()?.execute_batch(pragma).map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteAccess {
        let db = SqliteAccess::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price REAL, image BLOB)",
            &[],
        )
        .unwrap();
        db.execute("CREATE INDEX idx_products_name ON products (name)", &[])
            .unwrap();
        for i in 1..=5i64 {
            db.execute(
                "INSERT INTO products (id, name, price, image) VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Integer(i),
                    SqlValue::Text(format!("item {i}")),
                    SqlValue::Real(i as f64 * 1.5),
                    if i == 1 { SqlValue::Blob(vec![0, 1, 2]) } else { SqlValue::Null },
                ],
            )
            .unwrap();
        }
        db
    }

    #[test]
    fn test_list_tables_excludes_internal() {
        let db = seeded();
        db.execute("CREATE TABLE a_first (x)", &[]).unwrap();
        assert_eq!(db.list_tables().unwrap(), vec!["a_first", "products"]);
    }

    #[test]
    fn test_list_tables_keeps_names_resembling_internal_prefix() {
        let db = seeded();
        db.execute("CREATE TABLE SQLiteCache (k TEXT)", &[]).unwrap();
        db.execute("CREATE TABLE sqliteXlog (k TEXT)", &[]).unwrap();
        db.execute("CREATE TABLE lookup (k TEXT PRIMARY KEY)", &[])
            .unwrap();

        // the primary key above creates an internal sqlite_autoindex entry
        assert_eq!(
            db.list_tables().unwrap(),
            vec!["SQLiteCache", "lookup", "products", "sqliteXlog"]
        );
    }

    #[test]
    fn test_generated_columns_are_not_fetched() {
        let db = SqliteAccess::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, price REAL, \
             total REAL GENERATED ALWAYS AS (price * 2) VIRTUAL, note TEXT)",
            &[],
        )
        .unwrap();
        db.execute("INSERT INTO orders (id, price, note) VALUES (1, 2.5, 'x')", &[])
            .unwrap();

        assert_eq!(db.insert_columns("orders").unwrap(), vec!["id", "price", "note"]);
        let rows = db.fetch_page("orders", 0, 10).unwrap();
        assert_eq!(
            rows,
            vec![vec![SqlValue::Integer(1), SqlValue::Real(2.5), SqlValue::Text("x".into())]]
        );
        assert!(matches!(
            db.insert_columns("missing"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_fetch_page_without_rowid_orders_by_key() {
        let db = SqliteAccess::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE kv (bucket TEXT, k TEXT, v TEXT, PRIMARY KEY (bucket, k)) WITHOUT ROWID",
            &[],
        )
        .unwrap();
        for (bucket, k) in [("b", "2"), ("a", "9"), ("b", "1"), ("a", "1")] {
            db.execute(
                "INSERT INTO kv VALUES (?1, ?2, 'v')",
                &[SqlValue::from(bucket), SqlValue::from(k)],
            )
            .unwrap();
        }

        let mut seen = Vec::new();
        for offset in (0..4).step_by(3) {
            for row in db.fetch_page("kv", offset, 3).unwrap() {
                seen.push((row[0].clone(), row[1].clone()));
            }
        }

        let expected: Vec<_> = [("a", "1"), ("a", "9"), ("b", "1"), ("b", "2")]
            .into_iter()
            .map(|(b, k)| (SqlValue::from(b), SqlValue::from(k)))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_create_definition_includes_indexes() {
        let db = seeded();
        let definition = db.create_definition("products").unwrap();

        assert!(definition.starts_with("CREATE TABLE products"));
        assert!(definition.contains(";\nCREATE INDEX idx_products_name"));
        assert!(matches!(
            db.create_definition("missing"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_fetch_page_is_stable_and_bounded() {
        let db = seeded();
        let first = db.fetch_page("products", 0, 2).unwrap();
        let last = db.fetch_page("products", 4, 2).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0][0], SqlValue::Integer(1));
        assert_eq!(first[0][3], SqlValue::Blob(vec![0, 1, 2]));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0][0], SqlValue::Integer(5));
        assert!(db.fetch_page("products", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_rollback() {
        let db = seeded();
        db.begin().unwrap();
        db.execute("DELETE FROM products", &[]).unwrap();
        db.rollback().unwrap();

        assert_eq!(db.count_rows("products").unwrap(), 5);
        db.ping().unwrap();
    }

    #[test]
    fn test_integrity_toggle() {
        let db = seeded();
        db.set_integrity_checks(true).unwrap();
        let on = db.query("PRAGMA foreign_keys", &[]).unwrap();
        db.set_integrity_checks(false).unwrap();
        let off = db.query("PRAGMA foreign_keys", &[]).unwrap();

        assert_eq!(on[0][0], SqlValue::Integer(1));
        assert_eq!(off[0][0], SqlValue::Integer(0));
    }

    #[test]
    fn test_execute_reports_errors() {
        let db = seeded();
        assert!(matches!(
            db.execute("INSERT INTO nope VALUES (1)", &[]),
            Err(VaultError::Storage(_))
        ));
    }
}
