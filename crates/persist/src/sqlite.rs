use std::sync::Mutex;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use runvault_core::{ClientError, RecordData};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::{check_parent, check_result_name, parent_of, Record, RecordStore, ResultEntry};

/// SQLite-backed store. Simple, synchronous; one connection behind a mutex.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

fn sql(e: rusqlite::Error) -> ClientError {
    ClientError::transient(anyhow!(e).context("sqlite"))
}

fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const RECORD_COLS: &str = "name, parent, uid, type, data, create_ts, update_ts";

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Record, Vec<u8>)> {
    let blob: Vec<u8> = row.get(4)?;
    let rec = Record {
        name: row.get(0)?,
        parent: row.get(1)?,
        uid: row.get(2)?,
        data: RecordData { type_name: row.get(3)?, value: serde_json::Value::Null },
        create_time: from_ts(row.get(5)?),
        update_time: from_ts(row.get(6)?),
    };
    Ok((rec, blob))
}

fn decode(pair: (Record, Vec<u8>)) -> Result<Record, ClientError> {
    let (mut rec, blob) = pair;
    let raw = crate::maybe_decompress(&blob);
    rec.data.value = serde_json::from_slice(&raw)
        .with_context(|| format!("decoding payload of {}", rec.name))
        .map_err(ClientError::Transient)?;
    Ok(rec)
}

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("RUNVAULT_DB_PATH").unwrap_or_else(|_| crate::default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS results (
                name      TEXT PRIMARY KEY,
                uid       TEXT NOT NULL,
                create_ts INTEGER NOT NULL,
                update_ts INTEGER NOT NULL
            )",
            [],
        )
        .context("creating results table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                name      TEXT PRIMARY KEY,
                parent    TEXT NOT NULL,
                uid       TEXT NOT NULL,
                type      TEXT NOT NULL,
                data      BLOB NOT NULL,
                create_ts INTEGER NOT NULL,
                update_ts INTEGER NOT NULL
            )",
            [],
        )
        .context("creating records table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent, name)", []).ok();
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, ClientError> {
        self.db.lock().map_err(|_| ClientError::transient(anyhow!("sqlite connection lock poisoned")))
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn upsert_result(&self, name: &str) -> Result<ResultEntry, ClientError> {
        check_result_name(name)?;
        let now = ts(Utc::now());
        let mut db = self.lock()?;
        let tx = db.transaction().map_err(sql)?;
        tx.execute(
            "INSERT INTO results(name, uid, create_ts, update_ts) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET update_ts = excluded.update_ts",
            (name, Uuid::new_v4().to_string(), now),
        )
        .map_err(sql)?;
        let entry = tx
            .query_row("SELECT name, uid, create_ts, update_ts FROM results WHERE name = ?1", [name], |row| {
                Ok(ResultEntry {
                    name: row.get(0)?,
                    uid: row.get(1)?,
                    create_time: from_ts(row.get(2)?),
                    update_time: from_ts(row.get(3)?),
                })
            })
            .map_err(sql)?;
        tx.commit().map_err(sql)?;
        Ok(entry)
    }

    async fn upsert_record(&self, name: &str, data: &RecordData) -> Result<Record, ClientError> {
        let started = std::time::Instant::now();
        let parent = parent_of(name)?;
        let raw = serde_json::to_vec(&data.value)
            .context("encoding record payload")
            .map_err(ClientError::Transient)?;
        let blob = crate::maybe_compress(&raw);
        let now = ts(Utc::now());
        let mut db = self.lock()?;
        let tx = db.transaction().map_err(sql)?;
        tx.execute(
            "INSERT INTO records(name, parent, uid, type, data, create_ts, update_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(name) DO UPDATE SET type = excluded.type, data = excluded.data, update_ts = excluded.update_ts",
            (name, &parent, Uuid::new_v4().to_string(), &data.type_name, &blob, now),
        )
        .map_err(sql)?;
        let pair = tx
            .query_row(&format!("SELECT {} FROM records WHERE name = ?1", RECORD_COLS), [name], record_from_row)
            .map_err(sql)?;
        tx.commit().map_err(sql)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        decode(pair)
    }

    async fn get_record(&self, name: &str) -> Result<Record, ClientError> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let pair = db
            .query_row(&format!("SELECT {} FROM records WHERE name = ?1", RECORD_COLS), [name], record_from_row)
            .optional()
            .map_err(sql)?
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        decode(pair)
    }

    async fn list_records(&self, parent: &str) -> Result<Vec<Record>, ClientError> {
        check_parent(parent)?;
        let db = self.lock()?;
        let (clause, arg) = match runvault_core::naming::parse_result_name(parent) {
            Some((ns, runvault_core::naming::ANY_RESULT)) => {
                ("parent LIKE ?1", format!("{}/{}/%", ns, runvault_core::naming::RESULTS_SEGMENT))
            }
            _ => ("parent = ?1", parent.to_string()),
        };
        let mut stmt = db
            .prepare(&format!("SELECT {} FROM records WHERE {} ORDER BY name", RECORD_COLS, clause))
            .map_err(sql)?;
        let mut rows = stmt.query([arg]).map_err(sql)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql)? {
            out.push(decode(record_from_row(row).map_err(sql)?)?);
        }
        Ok(out)
    }
}
