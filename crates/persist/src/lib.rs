//! runvault persistence: the archival store holding Results and Records.
//!
//! Records are addressed by stable names derived from run identity (see
//! `runvault_core::naming`), so every write is an upsert keyed by name.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use runvault_core::{ClientError, RecordData};
use serde::{Deserialize, Serialize};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A grouping of records (one per run tree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub name: String,
    /// Store-assigned id, stable across upserts.
    pub uid: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// The archived copy of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    /// Name of the owning Result.
    pub parent: String,
    /// Store-assigned id, stable across upserts.
    pub uid: String,
    pub data: RecordData,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Storage service contract consumed by the reconciler and the query CLI.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the Result if absent; otherwise bump its update time.
    async fn upsert_result(&self, name: &str) -> Result<ResultEntry, ClientError>;

    /// Create the Record if absent, otherwise overwrite its payload.
    /// Safe to repeat with the same name.
    async fn upsert_record(&self, name: &str, data: &RecordData) -> Result<Record, ClientError>;

    async fn get_record(&self, name: &str) -> Result<Record, ClientError>;

    /// Records under `parent`, ordered by name. `parent` is a result name or
    /// `<namespace>/results/-` for every result in the namespace.
    async fn list_records(&self, parent: &str) -> Result<Vec<Record>, ClientError>;
}

/// Owning result name of a record name, rejecting anything malformed.
pub(crate) fn parent_of(record: &str) -> Result<String, ClientError> {
    match runvault_core::naming::parse_record_name(record) {
        Some((ns, result, _)) => Ok(runvault_core::naming::result_name(ns, result)),
        None => Err(ClientError::transient(anyhow::anyhow!(
            "invalid record name {:?} (expect <ns>/results/<result>/records/<record>)",
            record
        ))),
    }
}

pub(crate) fn check_result_name(name: &str) -> Result<(), ClientError> {
    match runvault_core::naming::parse_result_name(name) {
        Some((_, result)) if result != runvault_core::naming::ANY_RESULT => Ok(()),
        _ => Err(ClientError::transient(anyhow::anyhow!(
            "invalid result name {:?} (expect <ns>/results/<result>)",
            name
        ))),
    }
}

pub(crate) fn check_parent(parent: &str) -> Result<(), ClientError> {
    match runvault_core::naming::parse_result_name(parent) {
        Some(_) => Ok(()),
        None => Err(ClientError::transient(anyhow::anyhow!(
            "invalid parent {:?} (expect <ns>/results/<result> or <ns>/results/-)",
            parent
        ))),
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".runvault");
        let _ = std::fs::create_dir_all(&p);
        p.push("runvault.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "runvault.db".to_string()
}

pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("RUNVAULT_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    raw.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}
