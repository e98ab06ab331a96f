//! Persistence of scans, patches, applications and verifications as opaque JSON records.

use crate::error::{LifecycleError, Result};
use crate::file_io::write_atomic;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Scan,
    Patch,
    Application,
    Verification,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        Self::Scan,
        Self::Patch,
        Self::Application,
        Self::Verification,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Patch => "patch",
            Self::Application => "application",
            Self::Verification => "verification",
        }
    }

    const fn dir_name(self) -> &'static str {
        match self {
            Self::Scan => "scans",
            Self::Patch => "patches",
            Self::Application => "applications",
            Self::Verification => "verifications",
        }
    }
}

/// Key-value record store; each `put` is atomic per key
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, kind: RecordKind, id: &str, scan_id: &str, record: Value) -> Result<()>;

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>>;

    /// Ids of every record of `kind` belonging to `scan_id`, sorted
    async fn list_by_scan(&self, kind: RecordKind, scan_id: &str) -> Result<Vec<String>>;

    /// Returns whether a record was removed
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool>;
}

pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn Store,
    kind: RecordKind,
    id: &str,
    scan_id: &str,
    record: &T,
) -> Result<()> {
    store
        .put(kind, id, scan_id, serde_json::to_value(record)?)
        .await
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn Store,
    kind: RecordKind,
    id: &str,
) -> Result<Option<T>> {
    match store.get(kind, id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Like [`get_typed`], with a missing record reported as `NotFound`
pub async fn require_typed<T: DeserializeOwned>(
    store: &dyn Store,
    kind: RecordKind,
    id: &str,
) -> Result<T> {
    get_typed(store, kind, id)
        .await?
        .ok_or_else(|| LifecycleError::NotFound {
            kind: kind.as_str(),
            id: id.to_string(),
        })
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.contains("..");
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::storage(format!("invalid record id {id:?}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    scan_id: String,
    record: Value,
}

/// One pretty-printed JSON document per record under `data_dir/<kind>s/<id>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self
            .data_dir
            .join(kind.dir_name())
            .join(format!("{id}.json")))
    }

    async fn read_envelope(path: &Path) -> Result<Option<Envelope>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn put(&self, kind: RecordKind, id: &str, scan_id: &str, record: Value) -> Result<()> {
        let path = self.record_path(kind, id)?;
        let envelope = Envelope {
            scan_id: scan_id.to_string(),
            record,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&path, &bytes).await
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>> {
        let path = self.record_path(kind, id)?;
        Ok(Self::read_envelope(&path).await?.map(|e| e.record))
    }

    async fn list_by_scan(&self, kind: RecordKind, scan_id: &str) -> Result<Vec<String>> {
        let dir = self.data_dir.join(kind.dir_name());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::read_envelope(&path).await {
                Ok(Some(envelope)) if envelope.scan_id == scan_id => ids.push(id.to_string()),
                Ok(_) => {}
                Err(err) => log::warn!("skipping unreadable record {}: {err}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let path = self.record_path(kind, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(RecordKind, String), (String, Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, kind: RecordKind, id: &str, scan_id: &str, record: Value) -> Result<()> {
        validate_id(id)?;
        self.records
            .write()
            .await
            .insert((kind, id.to_string()), (scan_id.to_string(), record));
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(kind, id.to_string()))
            .map(|(_, record)| record.clone()))
    }

    async fn list_by_scan(&self, kind: RecordKind, scan_id: &str) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .iter()
            .filter(|((k, _), (s, _))| *k == kind && s == scan_id)
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .await
            .remove(&(kind, id.to_string()))
            .is_some())
    }
}
