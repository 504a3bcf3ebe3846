//! Record store collaborator.
//!
//! The core only needs single-record CRUD. [`RecordStore`] is the object-safe
//! seam over JSON documents; [`Repository`] layers typed access on top of it.

use crate::agent::Agent;
use crate::error::{ConductorError, ConductorResult};
use crate::execution::{Activity, Execution};
use crate::provider::ProviderRecord;
use crate::workflow::Workflow;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Workflow definitions.
    Workflow,
    /// Execution records.
    Execution,
    /// Agent snapshots.
    Agent,
    /// Capability provider registrations.
    Provider,
    /// Audit activity records.
    Activity,
}

impl RecordKind {
    /// Collection name, also the directory name on disk.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Workflow => "workflows",
            RecordKind::Execution => "executions",
            RecordKind::Agent => "agents",
            RecordKind::Provider => "providers",
            RecordKind::Activity => "activities",
        }
    }
}

/// Single-record CRUD over JSON documents. Each write is atomic on its own;
/// nothing spans records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, kind: RecordKind, id: &str, value: serde_json::Value)
        -> ConductorResult<()>;
    /// Fetch one record.
    async fn get(&self, kind: RecordKind, id: &str) -> ConductorResult<Option<serde_json::Value>>;
    /// Returns whether a record was removed.
    async fn delete(&self, kind: RecordKind, id: &str) -> ConductorResult<bool>;
    /// Every record of a kind, in no particular order.
    async fn list(&self, kind: RecordKind) -> ConductorResult<Vec<serde_json::Value>>;
}

/// A type stored in one [`RecordKind`] collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const KIND: RecordKind;

    /// Key the record is stored under.
    fn record_id(&self) -> String;
}

impl Record for Workflow {
    const KIND: RecordKind = RecordKind::Workflow;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Record for Execution {
    const KIND: RecordKind = RecordKind::Execution;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Agent {
    const KIND: RecordKind = RecordKind::Agent;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Record for ProviderRecord {
    const KIND: RecordKind = RecordKind::Provider;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

impl Record for Activity {
    const KIND: RecordKind = RecordKind::Activity;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Typed access to an injected [`RecordStore`].
#[derive(Clone)]
pub struct Repository {
    inner: Arc<dyn RecordStore>,
}

impl Repository {
    /// Wrap a store implementation.
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self { inner }
    }

    /// Repository over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Insert or replace a record.
    pub async fn save<T: Record>(&self, record: &T) -> ConductorResult<()> {
        let value = serde_json::to_value(record)?;
        self.inner.put(T::KIND, &record.record_id(), value).await
    }

    /// Fetch a record by id.
    pub async fn load<T: Record>(&self, id: &str) -> ConductorResult<Option<T>> {
        match self.inner.get(T::KIND, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Delete a record. Returns false if it did not exist.
    pub async fn remove<T: Record>(&self, id: &str) -> ConductorResult<bool> {
        self.inner.delete(T::KIND, id).await
    }

    /// Every record of type `T`. Documents that fail to decode are skipped.
    pub async fn load_all<T: Record>(&self) -> ConductorResult<Vec<T>> {
        let values = self.inner.list(T::KIND).await?;
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(kind = T::KIND.as_str(), error = %e, "Skipping undecodable record"),
            }
        }
        Ok(records)
    }
}

/// Ephemeral in-process store.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKind, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
    ) -> ConductorResult<()> {
        self.records
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> ConductorResult<Option<serde_json::Value>> {
        Ok(self
            .records
            .read()
            .await
            .get(&kind)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> ConductorResult<bool> {
        Ok(self
            .records
            .write()
            .await
            .get_mut(&kind)
            .is_some_and(|c| c.remove(id).is_some()))
    }

    async fn list(&self, kind: RecordKind) -> ConductorResult<Vec<serde_json::Value>> {
        Ok(self
            .records
            .read()
            .await
            .get(&kind)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// JSON files on disk, one per record: `<dir>/<kind>/<id>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn kind_dir(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(kind.as_str())
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> ConductorResult<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ConductorError::Storage(format!("Invalid record id '{id}'")));
        }
        Ok(self.kind_dir(kind).join(format!("{id}.json")))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
    ) -> ConductorResult<()> {
        let path = self.record_path(kind, id)?;
        tokio::fs::create_dir_all(self.kind_dir(kind)).await?;
        let json = serde_json::to_string_pretty(&value)?;
        // Write then rename so readers never see a partial document. Each
        // write owns its temp file; concurrent saves of one id race only on
        // the rename.
        let tmp = self
            .kind_dir(kind)
            .join(format!(".{id}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> ConductorResult<Option<serde_json::Value>> {
        let path = self.record_path(kind, id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&data).map_err(|e| {
            ConductorError::Storage(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> ConductorResult<bool> {
        let path = self.record_path(kind, id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        Ok(true)
    }

    async fn list(&self, kind: RecordKind) -> ConductorResult<Vec<serde_json::Value>> {
        let dir = self.kind_dir(kind);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut values = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&data) {
                Ok(value) => values.push(value),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt record"),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let repo = Repository::in_memory();
        let wf = Workflow::new("w1", "First");
        repo.save(&wf).await.unwrap();

        let loaded: Workflow = repo.load("w1").await.unwrap().unwrap();
        assert_eq!(loaded, wf);
        assert_eq!(repo.load_all::<Workflow>().await.unwrap().len(), 1);

        assert!(repo.remove::<Workflow>("w1").await.unwrap());
        assert!(!repo.remove::<Workflow>("w1").await.unwrap());
        assert!(repo.load::<Workflow>("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let repo = Repository::in_memory();
        repo.save(&Workflow::new("same", "W")).await.unwrap();
        repo.save(&Agent::new("same", "A")).await.unwrap();

        assert_eq!(repo.load_all::<Workflow>().await.unwrap().len(), 1);
        assert_eq!(repo.load_all::<Agent>().await.unwrap().len(), 1);
        assert!(repo.load::<ProviderRecord>("same").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_writes_to_one_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()).await.unwrap());

        let writers: Vec<_> = (0..16)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .put(RecordKind::Agent, "a1", serde_json::json!({ "n": n }))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let stored = store.get(RecordKind::Agent, "a1").await.unwrap().unwrap();
        assert!(stored["n"].as_u64().unwrap() < 16);
        assert_eq!(store.list(RecordKind::Agent).await.unwrap().len(), 1);
        let leftovers = std::fs::read_dir(dir.path().join(RecordKind::Agent.as_str()))
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension() != Some(std::ffi::OsStr::new("json"))
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().to_path_buf()).await.unwrap();
        let result = store
            .put(RecordKind::Workflow, "../escape", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ConductorError::Storage(_))));
    }
}
