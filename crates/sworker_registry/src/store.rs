//! Worker record persistence.
//!
//! Every operation runs in its own transaction on the database actor and is
//! keyed by `worker_id` (or by the registration index); nothing scans the
//! table.

use std::path::Path;

use sworker_db::{BlobCell, DbConnection, DbRow, DbTransaction, DbValue};
use sworker_ids::{RegistrationId, WorkerId};
use tracing::{debug, info};

use crate::error::{Result, WorkerError};
use crate::record::{
    ContentHash, ContentState, InstallState, ResponseHeaders, RowHandle, WorkerRecord,
};

const WORKERS_TABLE: &str = "workers";
const CONTENT_COLUMN: &str = "content";

const RECORD_COLUMNS: &str = "worker_id, url, install_state, registration_id, headers, \
                              length(content) AS content_size, content_hash, created_at";

/// Database-backed storage for worker records and their script bytes.
#[derive(Debug, Clone)]
pub struct WorkerStore {
    conn: DbConnection,
}

impl WorkerStore {
    /// Wrap an open connection, creating the schema if needed.
    pub async fn new(conn: DbConnection) -> Result<Self> {
        let store = Self { conn };
        store.init_tables().await?;
        Ok(store)
    }

    /// Open a store backed by a SQLite file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = DbConnection::open_sqlite(path.as_ref()).await?;
        Self::new(conn).await
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let conn = DbConnection::open_sqlite_memory().await?;
        Self::new(conn).await
    }

    async fn init_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS workers (
                    worker_id TEXT NOT NULL UNIQUE,
                    url TEXT NOT NULL,
                    install_state TEXT NOT NULL,
                    registration_id TEXT NOT NULL,
                    headers TEXT,
                    content BLOB,
                    content_hash TEXT,
                    created_at INTEGER NOT NULL,
                    CHECK(install_state IN ('installing', 'installed', 'activated', 'redundant')),
                    CHECK(content_hash IS NULL OR content IS NOT NULL)
                );

                CREATE INDEX IF NOT EXISTS idx_workers_registration
                    ON workers(registration_id);
                "#,
            )
            .await?;

        info!(location = ?self.conn.location(), "Worker store schema verified");
        Ok(())
    }

    /// Insert a new record. Fails if the id already exists.
    ///
    /// Only fresh records are accepted: headers, content and hash are written
    /// by the population pipeline, never at insert.
    pub async fn insert(&self, record: &WorkerRecord) -> Result<()> {
        if record.content_state() != ContentState::Empty
            || record.content_hash.is_some()
            || record.headers.is_some()
        {
            return Err(WorkerError::corrupt(format!(
                "worker {} must be inserted without headers or content",
                record.id
            )));
        }

        let params = vec![
            DbValue::from(record.id.as_str()),
            DbValue::from(record.url.as_str()),
            DbValue::from(record.install_state.as_str()),
            DbValue::from(record.registration_id.as_str()),
            DbValue::from(record.created_at),
        ];

        self.conn
            .transaction(move |tx| {
                tx.execute(
                    r#"
                    INSERT INTO workers
                        (worker_id, url, install_state, registration_id, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                    &params,
                )?;
                Ok::<_, WorkerError>(())
            })
            .await?;

        debug!(worker_id = %record.id, url = %record.url, "Inserted worker record");
        Ok(())
    }

    /// Load a record by id.
    pub async fn select_by_id(&self, id: &WorkerId) -> Result<Option<WorkerRecord>> {
        let key = DbValue::from(id.as_str());
        self.conn
            .transaction(move |tx| {
                let sql = format!("SELECT {RECORD_COLUMNS} FROM workers WHERE worker_id = ?");
                tx.query_optional(&sql, &[key])?
                    .as_ref()
                    .map(row_to_record)
                    .transpose()
            })
            .await
    }

    /// Rowid of the record, for addressing its content BLOB.
    pub async fn select_row_handle(&self, id: &WorkerId) -> Result<Option<RowHandle>> {
        let key = DbValue::from(id.as_str());
        self.conn
            .transaction(move |tx| {
                let rowid: Option<i64> = tx
                    .query_optional("SELECT rowid FROM workers WHERE worker_id = ?", &[key])?
                    .map(|row| row.get(0))
                    .transpose()?;
                Ok::<_, WorkerError>(rowid.map(RowHandle))
            })
            .await
    }

    /// All records owned by a registration, oldest first.
    pub async fn list_for_registration(
        &self,
        registration_id: &RegistrationId,
    ) -> Result<Vec<WorkerRecord>> {
        let key = DbValue::from(registration_id.as_str());
        self.conn
            .transaction(move |tx| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM workers WHERE registration_id = ? \
                     ORDER BY created_at ASC, rowid ASC"
                );
                tx.query_all(&sql, &[key])?
                    .iter()
                    .map(row_to_record)
                    .collect()
            })
            .await
    }

    pub async fn update_install_state(&self, id: &WorkerId, state: InstallState) -> Result<()> {
        let worker_id = id.clone();
        self.conn
            .transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE workers SET install_state = ? WHERE worker_id = ?",
                    &[
                        DbValue::from(state.as_str()),
                        DbValue::from(worker_id.as_str()),
                    ],
                )?;
                if changed == 0 {
                    return Err(WorkerError::NotFound(worker_id));
                }
                Ok(())
            })
            .await?;

        debug!(worker_id = %id, state = %state, "Updated install state");
        Ok(())
    }

    /// Write-once status of the content column.
    pub async fn content_state(&self, id: &WorkerId) -> Result<ContentState> {
        let worker_id = id.clone();
        self.conn
            .transaction(move |tx| content_state_in(tx, &worker_id).map(|(_, state)| state))
            .await
    }

    /// Record the response headers and allocate a zero-filled content slot of
    /// exactly `declared_size` bytes.
    ///
    /// Rejects with `AlreadyPopulated` when the record has any content,
    /// finished or not; the check and the allocation share one transaction.
    pub async fn update_headers_and_allocate_content(
        &self,
        id: &WorkerId,
        headers: &ResponseHeaders,
        declared_size: u64,
    ) -> Result<RowHandle> {
        let size = i64::try_from(declared_size)
            .map_err(|_| WorkerError::corrupt(format!("content size {declared_size} too large")))?;
        let headers_json = headers.to_json()?;
        let worker_id = id.clone();

        let handle = self
            .conn
            .transaction(move |tx| {
                let (rowid, state) = content_state_in(tx, &worker_id)?;
                if state != ContentState::Empty {
                    return Err(WorkerError::AlreadyPopulated(worker_id));
                }
                tx.execute(
                    r#"
                    UPDATE workers SET headers = ?, content = zeroblob(?)
                    WHERE rowid = ? AND content IS NULL
                    "#,
                    &[
                        DbValue::from(headers_json),
                        DbValue::from(size),
                        DbValue::from(rowid),
                    ],
                )?;
                Ok(RowHandle(rowid))
            })
            .await?;

        debug!(worker_id = %id, size = declared_size, "Allocated content slot");
        Ok(handle)
    }

    /// Copy `bytes` into an allocated content slot at `offset`.
    pub async fn write_content_chunk(
        &self,
        handle: RowHandle,
        offset: u64,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let cell = BlobCell {
            table: WORKERS_TABLE,
            column: CONTENT_COLUMN,
            rowid: handle.0,
        };
        self.conn.write_blob(cell, offset, bytes).await?;
        Ok(())
    }

    /// Record the digest of fully written content.
    pub async fn update_content_hash(&self, id: &WorkerId, hash: &ContentHash) -> Result<()> {
        let worker_id = id.clone();
        let digest = DbValue::from(hash.as_str());
        self.conn
            .transaction(move |tx| {
                let (rowid, state) = content_state_in(tx, &worker_id)?;
                match state {
                    ContentState::Unfinished => {}
                    ContentState::Populated => return Err(WorkerError::AlreadyPopulated(worker_id)),
                    ContentState::Empty => {
                        return Err(WorkerError::corrupt(format!(
                            "worker {worker_id} has no content to hash"
                        )))
                    }
                }
                tx.execute(
                    "UPDATE workers SET content_hash = ? WHERE rowid = ?",
                    &[digest, DbValue::from(rowid)],
                )?;
                Ok(())
            })
            .await?;

        debug!(worker_id = %id, hash = %hash, "Recorded content hash");
        Ok(())
    }

    /// Clear content and headers of a record whose population never finished.
    ///
    /// Returns `false` when there was nothing to discard. Populated content is
    /// never touched.
    pub async fn discard_unfinished_content(&self, id: &WorkerId) -> Result<bool> {
        let key = DbValue::from(id.as_str());
        let changed = self
            .conn
            .transaction(move |tx| {
                tx.execute(
                    r#"
                    UPDATE workers SET content = NULL, headers = NULL
                    WHERE worker_id = ? AND content IS NOT NULL AND content_hash IS NULL
                    "#,
                    &[key],
                )
                .map_err(WorkerError::from)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Stored hashes of two workers, read in one query.
    ///
    /// Fails with `NotFound` naming the first id that has no record.
    pub async fn select_content_hash_pair(
        &self,
        a: &WorkerId,
        b: &WorkerId,
    ) -> Result<(Option<ContentHash>, Option<ContentHash>)> {
        let (a, b) = (a.clone(), b.clone());
        self.conn
            .transaction(move |tx| {
                let rows = tx.query_all(
                    "SELECT worker_id, content_hash FROM workers WHERE worker_id IN (?, ?)",
                    &[DbValue::from(a.as_str()), DbValue::from(b.as_str())],
                )?;

                let mut hash_a = None;
                let mut hash_b = None;
                for row in &rows {
                    let worker_id: String = row.get_by_name("worker_id")?;
                    let hash: Option<String> = row.get_by_name("content_hash")?;
                    if worker_id == a.as_str() {
                        hash_a = Some(hash.clone());
                    }
                    if worker_id == b.as_str() {
                        hash_b = Some(hash);
                    }
                }

                let hash_a = hash_a.ok_or_else(|| WorkerError::NotFound(a.clone()))?;
                let hash_b = hash_b.ok_or_else(|| WorkerError::NotFound(b.clone()))?;
                Ok((
                    hash_a.map(ContentHash::from_stored),
                    hash_b.map(ContentHash::from_stored),
                ))
            })
            .await
    }

    /// Script bytes of a populated record; `None` until the hash is recorded.
    pub async fn read_content(&self, id: &WorkerId) -> Result<Option<Vec<u8>>> {
        let worker_id = id.clone();
        self.conn
            .transaction(move |tx| {
                let row = tx
                    .query_optional(
                        "SELECT content, content_hash FROM workers WHERE worker_id = ?",
                        &[DbValue::from(worker_id.as_str())],
                    )?
                    .ok_or_else(|| WorkerError::NotFound(worker_id.clone()))?;
                let hash: Option<String> = row.get_by_name("content_hash")?;
                if hash.is_none() {
                    return Ok(None);
                }
                let content: Option<Vec<u8>> = row.get_by_name("content")?;
                Ok(content)
            })
            .await
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &WorkerId) -> Result<bool> {
        let key = DbValue::from(id.as_str());
        let changed = self
            .conn
            .transaction(move |tx| {
                tx.execute("DELETE FROM workers WHERE worker_id = ?", &[key])
                    .map_err(WorkerError::from)
            })
            .await?;

        debug!(worker_id = %id, deleted = changed > 0, "Deleted worker record");
        Ok(changed > 0)
    }
}

fn content_state_in(tx: &mut DbTransaction<'_>, id: &WorkerId) -> Result<(i64, ContentState)> {
    let row = tx
        .query_optional(
            r#"
            SELECT rowid, content IS NOT NULL AS has_content, content_hash IS NOT NULL AS has_hash
            FROM workers WHERE worker_id = ?
            "#,
            &[DbValue::from(id.as_str())],
        )?
        .ok_or_else(|| WorkerError::NotFound(id.clone()))?;

    let rowid: i64 = row.get_by_name("rowid")?;
    let has_content: bool = row.get_by_name("has_content")?;
    let has_hash: bool = row.get_by_name("has_hash")?;
    let state = match (has_content, has_hash) {
        (false, _) => ContentState::Empty,
        (true, false) => ContentState::Unfinished,
        (true, true) => ContentState::Populated,
    };
    Ok((rowid, state))
}

fn row_to_record(row: &DbRow) -> Result<WorkerRecord> {
    let worker_id: String = row.get_by_name("worker_id")?;
    let registration_id: String = row.get_by_name("registration_id")?;
    let state: String = row.get_by_name("install_state")?;
    let headers: Option<String> = row.get_by_name("headers")?;

    Ok(WorkerRecord {
        id: WorkerId::parse(&worker_id).map_err(|e| WorkerError::corrupt(e.to_string()))?,
        registration_id: RegistrationId::parse(&registration_id)
            .map_err(|e| WorkerError::corrupt(e.to_string()))?,
        url: row.get_by_name("url")?,
        install_state: InstallState::parse(&state)
            .ok_or_else(|| WorkerError::corrupt(format!("unknown install state: {state}")))?,
        headers: headers.as_deref().map(ResponseHeaders::from_json).transpose()?,
        content_size: row.get_by_name("content_size")?,
        content_hash: row
            .get_by_name::<Option<String>>("content_hash")?
            .map(ContentHash::from_stored),
        created_at: row.get_by_name("created_at")?,
    })
}
