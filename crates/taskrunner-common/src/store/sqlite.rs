//! SQLite-backed record store
//!
//! One row per record in `job_records`. The `name` column carries the UNIQUE
//! constraint, and every update reads, checks and writes the row inside one
//! immediate transaction.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{RecordStore, RecordUpdate};
use crate::record::{JobParameters, JobStatus, Record, RecordId};
use crate::{Error, Result};

const COLUMNS: &str = "id, name, status, job_parameters, input_zip, \
                       start_time_ms, stop_time_ms, output_file_url, created_ms";

fn map_store_err(prefix: &str, err: impl fmt::Display) -> Error {
    Error::Store(format!("{prefix}: {err}"))
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| map_store_err("decode timestamp", ms))
}

/// Column values of one `job_records` row
struct StoredRecord {
    id: String,
    name: String,
    status: String,
    job_parameters: String,
    input_zip: Option<Vec<u8>>,
    start_time_ms: Option<i64>,
    stop_time_ms: Option<i64>,
    output_file_url: Option<String>,
    created_ms: i64,
}

impl StoredRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            job_parameters: row.get(3)?,
            input_zip: row.get(4)?,
            start_time_ms: row.get(5)?,
            stop_time_ms: row.get(6)?,
            output_file_url: row.get(7)?,
            created_ms: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        let mut job_parameters: JobParameters = serde_json::from_str(&self.job_parameters)
            .map_err(|e| map_store_err("decode job_parameters", e))?;
        job_parameters.input_zip = self.input_zip;

        Ok(Record {
            id: self.id.parse()?,
            name: self.name,
            status: self.status.parse()?,
            job_parameters,
            start_time: self.start_time_ms.map(from_ms).transpose()?,
            stop_time: self.stop_time_ms.map(from_ms).transpose()?,
            output_file_url: self.output_file_url,
            created: from_ms(self.created_ms)?,
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_records (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            job_parameters TEXT NOT NULL,
            input_zip BLOB,
            start_time_ms INTEGER,
            stop_time_ms INTEGER,
            output_file_url TEXT,
            created_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_job_records_status
        ON job_records (status, created_ms);
        ",
    )
    .map_err(|e| map_store_err("ensure schema", e))
}

fn select_by(conn: &Connection, column: &str, value: &str) -> Result<Option<Record>> {
    let sql = format!("SELECT {COLUMNS} FROM job_records WHERE {column} = ?1");
    conn.query_row(&sql, params![value], StoredRecord::from_row)
        .optional()
        .map_err(|e| map_store_err("query record", e))?
        .map(StoredRecord::into_record)
        .transpose()
}

/// Records in a SQLite database, shared by every clone
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| map_store_err("create parent dir", e))?;
        }
        let conn = Connection::open(path).map_err(|e| map_store_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_store_err("set journal_mode", e))?;
        debug!(path = %path.display(), "opened record database");
        Self::from_connection(conn)
    }

    /// A private database that disappears with the store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_store_err("open sqlite db", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection off the async runtime
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| map_store_err("lock", "sqlite connection mutex poisoned"))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| map_store_err("store task", e))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: Record) -> Result<Record> {
        self.run(move |conn| {
            let job_parameters = serde_json::to_string(&record.job_parameters)
                .map_err(|e| map_store_err("encode job_parameters", e))?;
            let id = record.id.to_string();
            let inserted = conn.execute(
                &format!("INSERT INTO job_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    id,
                    record.name,
                    record.status.as_str(),
                    job_parameters,
                    record.job_parameters.input_zip,
                    record.start_time.map(|t| t.timestamp_millis()),
                    record.stop_time.map(|t| t.timestamp_millis()),
                    record.output_file_url,
                    record.created.timestamp_millis(),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(Error::NameTaken { name: record.name });
                }
                Err(e) => return Err(map_store_err("insert record", e)),
            }
            select_by(conn, "id", &id)?.ok_or(Error::RecordNotFound { id })
        })
        .await
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.run(move |conn| select_by(conn, "id", &id.to_string()))
            .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Record>> {
        let name = name.to_string();
        self.run(move |conn| select_by(conn, "name", &name)).await
    }

    async fn update(&self, id: RecordId, update: RecordUpdate) -> Result<Record> {
        self.run(move |conn| {
            let id = id.to_string();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_store_err("begin tx", e))?;

            let mut next = select_by(&tx, "id", &id)?
                .ok_or_else(|| Error::RecordNotFound { id: id.clone() })?;
            // dropping `tx` on error rolls back
            update.apply(&mut next)?;

            tx.execute(
                "UPDATE job_records
                 SET status = ?2, start_time_ms = ?3, stop_time_ms = ?4, output_file_url = ?5
                 WHERE id = ?1",
                params![
                    id,
                    next.status.as_str(),
                    next.start_time.map(|t| t.timestamp_millis()),
                    next.stop_time.map(|t| t.timestamp_millis()),
                    next.output_file_url,
                ],
            )
            .map_err(|e| map_store_err("update record", e))?;
            let stored = select_by(&tx, "id", &id)?.ok_or(Error::RecordNotFound { id })?;
            tx.commit().map_err(|e| map_store_err("commit tx", e))?;
            Ok(stored)
        })
        .await
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Record>> {
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM job_records
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_ms, name"
                ))
                .map_err(|e| map_store_err("prepare list", e))?;
            let rows = stmt
                .query_map(params![status.map(JobStatus::as_str)], StoredRecord::from_row)
                .map_err(|e| map_store_err("list records", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| map_store_err("read record row", e))?;
            rows.into_iter().map(StoredRecord::into_record).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn test_db_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("taskrunner-{name}-{ts}.sqlite"))
    }

    fn record(name: &str) -> Record {
        Record::new(
            Some(name.to_string()),
            JobParameters {
                docker_image: "worker:v1".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn name_column_is_unique() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert(record("x")).await.unwrap();

        let err = store.insert(record("x")).await.unwrap_err();
        assert!(matches!(err, Error::NameTaken { ref name } if name == "x"));
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let path = test_db_path("reopen");
        let mut r = record("x");
        r.job_parameters.input_zip = Some(b"PK\x03\x04".to_vec());
        r.job_parameters
            .environment_variables
            .insert("MODE".to_string(), "fast".to_string());
        let id = r.id;

        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.insert(r).await.unwrap();
            store
                .update(id, RecordUpdate::new().status(JobStatus::Cleaning))
                .await
                .unwrap();
            store
                .update(
                    id,
                    RecordUpdate::new()
                        .status(JobStatus::Succeeded)
                        .output_file_url("https://storage.example/x-output.zip")
                        .stop_time(at_ms(1_700_000_000_500)),
                )
                .await
                .unwrap();
        }

        let store = SqliteRecordStore::open(&path).unwrap();
        let reloaded = store.find_by_name("x").await.unwrap().unwrap();
        assert_eq!(reloaded.id, id);
        assert_eq!(reloaded.status, JobStatus::Succeeded);
        assert_eq!(
            reloaded.output_file_url.as_deref(),
            Some("https://storage.example/x-output.zip")
        );
        assert_eq!(reloaded.stop_time, Some(at_ms(1_700_000_000_500)));
        assert_eq!(
            reloaded.job_parameters.input_zip.as_deref(),
            Some(&b"PK\x03\x04"[..])
        );
        assert_eq!(reloaded.job_parameters.environment_variables["MODE"], "fast");

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejected_transition_rolls_back() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let r = store.insert(record("x")).await.unwrap();

        let err = store
            .update(
                r.id,
                RecordUpdate::new()
                    .status(JobStatus::Killed)
                    .stop_time(Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let reloaded = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Created);
        assert!(reloaded.stop_time.is_none());

        // the connection is usable again after the rollback
        store
            .update(r.id, RecordUpdate::new().status(JobStatus::Running))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn racing_terminal_updates_apply_once() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let r = store.insert(record("x")).await.unwrap();
        store
            .update(r.id, RecordUpdate::new().status(JobStatus::Cleaning))
            .await
            .unwrap();

        let (killed, succeeded) = tokio::join!(
            store.update(r.id, RecordUpdate::new().status(JobStatus::Killed)),
            store.update(r.id, RecordUpdate::new().status(JobStatus::Succeeded)),
        );
        assert_eq!(killed.is_ok() as u8 + succeeded.is_ok() as u8, 1);

        let status = store.get(r.id).await.unwrap().unwrap().status;
        assert!(status == JobStatus::Killed || status == JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let err = store
            .update(RecordId::new(), RecordUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { .. }));
        assert!(store.get(RecordId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_oldest_first() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut newer = record("a");
        newer.created = at_ms(2_000);
        let mut older = record("b");
        older.created = at_ms(1_000);
        let mut tie = record("c");
        tie.created = at_ms(1_000);

        let newer = store.insert(newer).await.unwrap();
        store.insert(tie).await.unwrap();
        store.insert(older).await.unwrap();
        store
            .update(newer.id, RecordUpdate::new().status(JobStatus::Running))
            .await
            .unwrap();

        let names: Vec<String> = store
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["b", "c", "a"]);

        let running = store.list(Some(JobStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "a");
        assert!(store.list(Some(JobStatus::Failed)).await.unwrap().is_empty());
    }
}
