//! SQLite connection actor.
//!
//! A single `rusqlite::Connection` lives on a dedicated thread. Every request
//! (statement, transaction, blob write) is shipped to that thread as a closure
//! and answered over a oneshot channel, so callers stay async and all access
//! to the connection is serialized.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::{params_from_iter, Connection, DatabaseName, TransactionBehavior};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, info, warn};

use crate::error::{BackendError, Result};
use crate::value::{DbRow, DbValue, FromDbValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Location of a single BLOB cell, addressed by rowid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobCell {
    pub table: &'static str,
    pub column: &'static str,
    pub rowid: i64,
}

/// Handle to the connection actor. Clone is cheap and shares the actor.
#[derive(Clone)]
pub struct DbConnection {
    sender: mpsc::UnboundedSender<Job>,
    location: Option<PathBuf>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"SQLite")
            .field("location", &self.location)
            .finish()
    }
}

impl DbConnection {
    /// Open (or create) a SQLite database file in WAL mode.
    pub async fn open_sqlite(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let owned = path.to_path_buf();
        let conn = Self::spawn(Some(owned.clone()), move || {
            let conn = Connection::open(&owned)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(conn)
        })
        .await?;

        info!(path = %path.display(), "Opened SQLite database");
        Ok(conn)
    }

    /// Open an in-memory SQLite database (for testing).
    pub async fn open_sqlite_memory() -> Result<Self> {
        let conn = Self::spawn(None, || Ok(Connection::open_in_memory()?)).await?;
        debug!("Opened in-memory SQLite database");
        Ok(conn)
    }

    async fn spawn<F>(location: Option<PathBuf>, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Connection> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("sworker-db".to_string())
            .spawn(move || {
                let mut conn = match open().and_then(|conn| {
                    conn.pragma_update(None, "foreign_keys", "ON")?;
                    conn.busy_timeout(BUSY_TIMEOUT)?;
                    Ok(conn)
                }) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while let Some(job) = receiver.blocking_recv() {
                    job(&mut conn);
                }
                debug!("SQLite actor shutting down");
            })?;

        ready_rx.await.map_err(|_| BackendError::Closed)??;

        Ok(Self { sender, location })
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Run a closure against the raw connection on the actor thread.
    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Box::new(move |conn| {
                let _ = reply_tx.send(op(conn));
            }))
            .map_err(|_| BackendError::Closed)?;
        reply_rx.await.map_err(|_| BackendError::Closed)?
    }

    /// Execute a SQL statement (no results). Returns the number of rows changed.
    pub async fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |conn| execute_on(conn, &sql, &params)).await
    }

    /// Execute a batch of SQL statements.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.call(move |conn| execute_batch_on(conn, &sql)).await
    }

    /// Query and return all rows.
    pub async fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |conn| query_on(conn, &sql, &params)).await
    }

    /// Query and return the first row, if any.
    pub async fn query_optional(&self, sql: &str, params: &[DbValue]) -> Result<Option<DbRow>> {
        let rows = self.query_all(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow> {
        self.query_optional(sql, params)
            .await?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    /// Query and return a single scalar value.
    pub async fn query_scalar<T: FromDbValue>(&self, sql: &str, params: &[DbValue]) -> Result<T> {
        let row = self.query_one(sql, params).await?;
        row.get(0)
    }

    /// Execute a closure inside an IMMEDIATE transaction on the actor thread.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise. The error
    /// type is the caller's, so domain failures raised inside the closure
    /// abort the transaction just like database errors do.
    pub async fn transaction<T, E, F>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut DbTransaction<'_>) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<BackendError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Box::new(move |conn| {
                let _ = reply_tx.send(run_transaction(conn, op));
            }))
            .map_err(|_| E::from(BackendError::Closed))?;
        reply_rx.await.map_err(|_| E::from(BackendError::Closed))?
    }

    /// Overwrite `bytes.len()` bytes of an existing BLOB starting at `offset`.
    ///
    /// The BLOB must already have its final size (e.g. via `zeroblob(n)`);
    /// incremental I/O cannot grow a value.
    pub async fn write_blob(&self, cell: BlobCell, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| BackendError::invalid_input(format!("Blob offset {} too large", offset)))?;
        self.call(move |conn| {
            let span = debug_span!(
                "db.blob_write",
                table = cell.table,
                rowid = cell.rowid,
                offset,
                len = bytes.len()
            );
            let _guard = span.enter();

            let mut blob =
                conn.blob_open(DatabaseName::Main, cell.table, cell.column, cell.rowid, false)?;
            let end = start.checked_add(bytes.len()).ok_or_else(|| {
                BackendError::invalid_input("Blob write range overflows".to_string())
            })?;
            if end > blob.len() {
                return Err(BackendError::invalid_input(format!(
                    "Blob write of {} bytes at {} exceeds allocated size {}",
                    bytes.len(),
                    start,
                    blob.len()
                )));
            }
            blob.write_at(&bytes, start)?;
            Ok(())
        })
        .await
    }
}

fn run_transaction<T, E, F>(conn: &mut Connection, op: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut DbTransaction<'_>) -> std::result::Result<T, E>,
    E: From<BackendError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(BackendError::from)?;

    let result = {
        let mut db_tx = DbTransaction { conn: &tx };
        op(&mut db_tx)
    };

    match result {
        Ok(value) => {
            tx.commit().map_err(BackendError::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Statement surface available inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64> {
        execute_on(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        execute_batch_on(self.conn, sql)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
        query_on(self.conn, sql, params)
    }

    pub fn query_optional(&mut self, sql: &str, params: &[DbValue]) -> Result<Option<DbRow>> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    pub fn query_one(&mut self, sql: &str, params: &[DbValue]) -> Result<DbRow> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    pub fn query_scalar<T: FromDbValue>(&mut self, sql: &str, params: &[DbValue]) -> Result<T> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    /// Rowid of the most recent successful INSERT on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}

fn execute_on(conn: &Connection, sql: &str, params: &[DbValue]) -> Result<u64> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    let values: Vec<rusqlite::types::Value> = params.iter().map(DbValue::to_sqlite).collect();
    let changed = stmt.execute(params_from_iter(values.iter()))?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(changed as u64)
}

fn execute_batch_on(conn: &Connection, sql: &str) -> Result<()> {
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    conn.execute_batch(sql)?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on(conn: &Connection, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let values: Vec<rusqlite::types::Value> = params.iter().map(DbValue::to_sqlite).collect();

    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            out.push(DbValue::from_sqlite(row.get_ref(index)?));
        }
        result.push(DbRow::new(columns.clone(), out));
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(result)
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit hash for low-cardinality, stable identification.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: BlobCell = BlobCell {
        table: "t",
        column: "data",
        rowid: 1,
    };

    async fn blob_table() -> DbConnection {
        let conn = DbConnection::open_sqlite_memory().await.unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, data BLOB);
             INSERT INTO t (id, data) VALUES (1, zeroblob(8));",
        )
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn write_blob_fills_allocated_slot() {
        let conn = blob_table().await;
        conn.write_blob(CELL, 0, b"abcd".to_vec()).await.unwrap();
        conn.write_blob(CELL, 4, b"efgh".to_vec()).await.unwrap();

        let data: Vec<u8> = conn
            .query_scalar("SELECT data FROM t WHERE id = 1", &[])
            .await
            .unwrap();
        assert_eq!(data, b"abcdefgh");
    }

    #[tokio::test]
    async fn write_blob_rejects_writes_past_allocation() {
        let conn = blob_table().await;
        let err = conn
            .write_blob(CELL, 6, b"abcd".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let conn = DbConnection::open_sqlite_memory().await.unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, marker TEXT)")
            .await
            .unwrap();

        let result: std::result::Result<(), BackendError> = conn
            .transaction(|tx| {
                tx.execute("INSERT INTO t (marker) VALUES (?)", &[DbValue::from("x")])?;
                Err(BackendError::invalid_input("abort"))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = conn
            .query_scalar("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn transaction_reports_last_insert_rowid() {
        let conn = DbConnection::open_sqlite_memory().await.unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, marker TEXT)")
            .await
            .unwrap();

        let rowid: i64 = conn
            .transaction(|tx| {
                tx.execute("INSERT INTO t (marker) VALUES (?)", &[DbValue::from("a")])?;
                tx.execute("INSERT INTO t (marker) VALUES (?)", &[DbValue::from("b")])?;
                Ok::<_, BackendError>(tx.last_insert_rowid())
            })
            .await
            .unwrap();
        assert_eq!(rowid, 2);
    }

    #[test]
    fn sql_op_name_takes_first_keyword() {
        assert_eq!(sql_op_name("  SELECT * FROM t"), "SELECT");
        assert_eq!(sql_op_name(""), "unknown");
    }
}
