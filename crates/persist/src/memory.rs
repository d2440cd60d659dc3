use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;
use chrono::Utc;
use metrics::counter;
use runvault_core::{ClientError, RecordData};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{check_parent, check_result_name, parent_of, Record, RecordStore, ResultEntry};

#[derive(Default)]
struct Tables {
    results: FxHashMap<String, ResultEntry>,
    records: FxHashMap<String, Record>,
}

/// In-process store. Backs tests and single-process demos; can be flipped
/// into an "unavailable" mode to exercise transient failure paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    record_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with a transient error.
    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.tables.lock().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn result_count(&self) -> usize {
        self.tables.lock().map(|t| t.results.len()).unwrap_or(0)
    }

    /// Number of successful `upsert_record` calls.
    pub fn record_writes(&self) -> u64 {
        self.record_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::transient(anyhow!("store unavailable")));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, ClientError> {
        self.tables.lock().map_err(|_| ClientError::transient(anyhow!("memory store lock poisoned")))
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_result(&self, name: &str) -> Result<ResultEntry, ClientError> {
        self.check_available()?;
        check_result_name(name)?;
        let now = Utc::now();
        let mut t = self.lock()?;
        let entry = t
            .results
            .entry(name.to_string())
            .and_modify(|r| r.update_time = now)
            .or_insert_with(|| ResultEntry {
                name: name.to_string(),
                uid: Uuid::new_v4().to_string(),
                create_time: now,
                update_time: now,
            });
        Ok(entry.clone())
    }

    async fn upsert_record(&self, name: &str, data: &RecordData) -> Result<Record, ClientError> {
        self.check_available()?;
        let parent = parent_of(name)?;
        let now = Utc::now();
        let mut t = self.lock()?;
        let rec = t
            .records
            .entry(name.to_string())
            .and_modify(|r| {
                r.data = data.clone();
                r.update_time = now;
            })
            .or_insert_with(|| Record {
                name: name.to_string(),
                parent,
                uid: Uuid::new_v4().to_string(),
                data: data.clone(),
                create_time: now,
                update_time: now,
            })
            .clone();
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        counter!("persist_put_total", 1u64);
        Ok(rec)
    }

    async fn get_record(&self, name: &str) -> Result<Record, ClientError> {
        self.check_available()?;
        let t = self.lock()?;
        t.records.get(name).cloned().ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    async fn list_records(&self, parent: &str) -> Result<Vec<Record>, ClientError> {
        self.check_available()?;
        check_parent(parent)?;
        let t = self.lock()?;
        let mut out: Vec<Record> = t
            .records
            .values()
            .filter(|r| runvault_core::naming::record_in_parent(&r.name, parent))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
