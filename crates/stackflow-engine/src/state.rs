//! State management for deployed resources
//!
//! The state records, for every resource the engine has created, the provider
//! handle, a hash of the applied configuration and the outputs reported by the
//! provider. [`FileStateStore`] keeps one file per stack under
//! `.stackflow/state/<stack>.json`.

use crate::error::{EngineError, Result};
use crate::provider::{Outputs, ProviderHandle, ResolvedConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackflow_core::{ResourceAddress, ResourceKind, StackId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;
const STATE_SUBDIR: &str = "state";
const LOCK_FILE: &str = "lock.json";

/// Persisted record of a single deployed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub address: ResourceAddress,

    pub kind: ResourceKind,

    /// Provider-assigned identifier
    pub handle: ProviderHandle,

    /// Hash of the resolved configuration last applied
    pub config_hash: String,

    /// Resolved configuration last applied
    #[serde(default)]
    pub applied_config: ResolvedConfig,

    /// Output attributes (endpoint, ARN, ...)
    #[serde(default)]
    pub outputs: Outputs,

    /// Resources this one depended on when it was applied
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,

    /// Last-modified token, bumped on every save
    #[serde(default)]
    pub revision: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(address: ResourceAddress, kind: ResourceKind, handle: ProviderHandle) -> Self {
        let now = Utc::now();
        Self {
            address,
            kind,
            handle,
            config_hash: String::new(),
            applied_config: ResolvedConfig::new(),
            outputs: Outputs::new(),
            dependencies: Vec::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, config_hash: impl Into<String>, config: ResolvedConfig) -> Self {
        self.config_hash = config_hash.into();
        self.applied_config = config;
        self
    }

    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = ResourceAddress>,
    ) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn output(&self, attribute: &str) -> Option<&str> {
        self.outputs.get(attribute).map(String::as_str)
    }
}

/// Point-in-time view of every recorded resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    records: BTreeMap<ResourceAddress, StateRecord>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.address.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&StateRecord> {
        self.records.get(address)
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.records.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stack ids that have at least one record
    pub fn stacks(&self) -> BTreeSet<StackId> {
        self.records.keys().map(|a| a.stack.clone()).collect()
    }

    pub fn output(&self, address: &ResourceAddress, attribute: &str) -> Option<&str> {
        self.get(address).and_then(|r| r.output(attribute))
    }

    /// Recorded dependencies, restricted to resources that are still recorded
    pub fn dependency_map(&self) -> BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> {
        self.records
            .iter()
            .map(|(address, record)| {
                let deps = record
                    .dependencies
                    .iter()
                    .filter(|d| self.records.contains_key(d))
                    .cloned()
                    .collect();
                (address.clone(), deps)
            })
            .collect()
    }
}

/// Persistent store for state records
///
/// `save` and `delete` are optimistic: they fail with
/// [`EngineError::StateConflict`] when the stored revision differs from the
/// one the caller read. A record with revision 0 is new and must not exist yet.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every record
    async fn load(&self) -> Result<StateSnapshot>;

    /// Create or replace a record, returning its new revision
    async fn save(&self, record: &StateRecord) -> Result<u64>;

    /// Remove a record
    async fn delete(&self, address: &ResourceAddress, expected_revision: u64) -> Result<()>;
}

fn check_revision(
    address: &ResourceAddress,
    stored: Option<&StateRecord>,
    expected: u64,
) -> Result<()> {
    match stored {
        Some(current) if current.revision != expected => Err(EngineError::state_conflict(
            address,
            format!(
                "stored revision is {} but {} was expected",
                current.revision, expected
            ),
        )),
        None if expected != 0 => Err(EngineError::state_conflict(
            address,
            format!("record was removed (expected revision {})", expected),
        )),
        _ => Ok(()),
    }
}

fn next_revision(record: &StateRecord) -> StateRecord {
    let mut stored = record.clone();
    stored.revision = record.revision + 1;
    stored.updated_at = Utc::now();
    stored
}

/// In-memory state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<ResourceAddress, StateRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot (used for dry runs)
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            records: Mutex::new(
                snapshot
                    .iter()
                    .map(|r| (r.address.clone(), r.clone()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let records = self.records.lock().await;
        Ok(StateSnapshot::from_records(records.values().cloned()))
    }

    async fn save(&self, record: &StateRecord) -> Result<u64> {
        let mut records = self.records.lock().await;
        check_revision(&record.address, records.get(&record.address), record.revision)?;
        let stored = next_revision(record);
        let revision = stored.revision;
        records.insert(stored.address.clone(), stored);
        Ok(revision)
    }

    async fn delete(&self, address: &ResourceAddress, expected_revision: u64) -> Result<()> {
        let mut records = self.records.lock().await;
        check_revision(address, records.get(address), expected_revision)?;
        records.remove(address);
        Ok(())
    }
}

/// State file for a single stack
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StackStateFile {
    /// State file version
    version: u32,

    /// Last modified timestamp
    updated_at: DateTime<Utc>,

    /// Records indexed by resource id
    #[serde(default)]
    resources: BTreeMap<String, StateRecord>,
}

impl Default for StackStateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

/// File-backed state store
///
/// Writes are serialized by an async mutex and land through a temporary file
/// and a rename, keeping a `.backup` of the previous version.
pub struct FileStateStore {
    /// State root (e.g. `.stackflow`)
    root: PathBuf,

    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_SUBDIR)
    }

    fn stack_path(&self, stack: &str) -> PathBuf {
        self.state_dir().join(format!("{}.json", stack))
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    async fn read_stack_file(path: &Path) -> Result<StackStateFile> {
        if !path.exists() {
            return Ok(StackStateFile::default());
        }

        let content = fs::read_to_string(path).await?;
        let file: StackStateFile = serde_json::from_str(&content).map_err(|e| {
            EngineError::StateError(format!("{} を読み込めません: {}", path.display(), e))
        })?;

        if file.version > STATE_VERSION {
            return Err(EngineError::StateError(format!(
                "State file {} has version {}, newer than supported version {}",
                path.display(),
                file.version,
                STATE_VERSION
            )));
        }

        Ok(file)
    }

    async fn write_stack_file(&self, stack: &str, mut file: StackStateFile) -> Result<()> {
        let dir = self.state_dir();
        Self::ensure_dir(&dir).await?;

        let path = self.stack_path(stack);
        let backup = dir.join(format!("{}.json.backup", stack));

        if path.exists() {
            fs::copy(&path, &backup).await?;
        }

        if file.resources.is_empty() {
            if path.exists() {
                fs::remove_file(&path).await?;
            }
            tracing::debug!(stack, "Removed empty state file");
            return Ok(());
        }

        file.version = STATE_VERSION;
        file.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(&file)?;

        let tmp = dir.join(format!("{}.json.tmp", stack));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!(
            stack,
            resources = file.resources.len(),
            "Saved state file"
        );
        Ok(())
    }

    /// Acquire the run-level advisory lock
    ///
    /// A lock older than one hour is considered stale and replaced.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        Self::ensure_dir(&self.root).await?;

        let lock_path = self.lock_path();

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            match serde_json::from_str::<LockInfo>(&content) {
                Ok(lock_info) => {
                    let age = Utc::now().signed_duration_since(lock_info.acquired_at);
                    if age.num_hours() < 1 {
                        return Err(EngineError::LockError(format!(
                            "State is locked by {} (pid {}) since {}",
                            lock_info.holder, lock_info.pid, lock_info.acquired_at
                        )));
                    }
                    tracing::warn!("Removing stale lock from {}", lock_info.holder);
                }
                Err(e) => {
                    tracing::warn!("Removing unreadable lock file: {}", e);
                }
            }
            fs::remove_file(&lock_path).await?;
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
            .map_err(|e| EngineError::LockError(format!("{}: {}", lock_path.display(), e)))?;
        file.write_all(serde_json::to_string_pretty(&lock_info)?.as_bytes())
            .await?;
        file.flush().await?;

        tracing::debug!("Acquired state lock");
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let dir = self.state_dir();
        if !dir.exists() {
            tracing::debug!("State directory not found, returning empty state");
            return Ok(StateSnapshot::new());
        }

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = Self::read_stack_file(&path).await?;
            records.extend(file.resources.into_values());
        }

        tracing::debug!("Loaded state with {} resources", records.len());
        Ok(StateSnapshot::from_records(records))
    }

    async fn save(&self, record: &StateRecord) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let stack = record.address.stack.as_str();
        let mut file = Self::read_stack_file(&self.stack_path(stack)).await?;

        check_revision(
            &record.address,
            file.resources.get(&record.address.resource),
            record.revision,
        )?;

        let stored = next_revision(record);
        let revision = stored.revision;
        file.resources
            .insert(record.address.resource.clone(), stored);
        self.write_stack_file(stack, file).await?;

        Ok(revision)
    }

    async fn delete(&self, address: &ResourceAddress, expected_revision: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut file = Self::read_stack_file(&self.stack_path(&address.stack)).await?;
        check_revision(
            address,
            file.resources.get(&address.resource),
            expected_revision,
        )?;

        file.resources.remove(&address.resource);
        self.write_stack_file(&address.stack, file).await
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    #[serde(default)]
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(stack: &str, resource: &str) -> StateRecord {
        let mut outputs = Outputs::new();
        outputs.insert("vpc_id".to_string(), "vpc-123".to_string());
        StateRecord::new(
            ResourceAddress::new(stack, resource),
            ResourceKind::Network,
            ProviderHandle::new(format!("h-{}", resource)),
        )
        .with_config("hash-1", ResolvedConfig::new())
        .with_outputs(outputs)
    }

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path());

        let revision = store.save(&record("network", "vpc")).await.unwrap();
        assert_eq!(revision, 1);
        store.save(&record("storage", "bucket")).await.unwrap();

        assert!(temp_dir.path().join("state/network.json").exists());
        assert!(temp_dir.path().join("state/storage.json").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        let vpc = loaded.get(&ResourceAddress::new("network", "vpc")).unwrap();
        assert_eq!(vpc.revision, 1);
        assert_eq!(vpc.output("vpc_id"), Some("vpc-123"));
        assert_eq!(
            loaded.stacks().into_iter().collect::<Vec<_>>(),
            vec!["network", "storage"]
        );
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path());

        let state = store.load().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_stale_revision_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path());

        store.save(&record("network", "vpc")).await.unwrap();

        // revision 0 means "new", but the record already exists
        let result = store.save(&record("network", "vpc")).await;
        assert!(matches!(result, Err(EngineError::StateConflict { .. })));

        let mut current = record("network", "vpc");
        current.revision = 1;
        assert_eq!(store.save(&current).await.unwrap(), 2);

        // someone else already moved it to revision 2
        let result = store.save(&current).await;
        assert!(matches!(result, Err(EngineError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path());
        let address = ResourceAddress::new("network", "vpc");

        store.save(&record("network", "vpc")).await.unwrap();

        let result = store.delete(&address, 5).await;
        assert!(matches!(result, Err(EngineError::StateConflict { .. })));

        store.delete(&address, 1).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        assert!(!temp_dir.path().join("state/network.json").exists());
        assert!(temp_dir.path().join("state/network.json.backup").exists());
    }

    #[tokio::test]
    async fn test_unknown_fields_are_ignored() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("state");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("network.json"),
            r#"{
                "version": 1,
                "updated_at": "2026-01-01T00:00:00Z",
                "future_field": {"anything": true},
                "resources": {
                    "vpc": {
                        "address": "network.vpc",
                        "kind": "network",
                        "handle": "h-1",
                        "config_hash": "abc",
                        "drift_detected": false,
                        "created_at": "2026-01-01T00:00:00Z",
                        "updated_at": "2026-01-01T00:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();

        let store = FileStateStore::new(temp_dir.path());
        let snapshot = store.load().await.unwrap();
        let vpc = snapshot
            .get(&ResourceAddress::new("network", "vpc"))
            .unwrap();
        assert_eq!(vpc.handle, ProviderHandle::new("h-1"));
        assert_eq!(vpc.revision, 0);
        assert!(vpc.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("state");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("network.json"),
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z", "resources": {}}"#,
        )
        .unwrap();

        let store = FileStateStore::new(temp_dir.path());
        assert!(matches!(
            store.load().await,
            Err(EngineError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_lock() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path());

        let lock = store.acquire_lock().await.unwrap();
        assert!(matches!(
            store.acquire_lock().await,
            Err(EngineError::LockError(_))
        ));

        lock.release().await.unwrap();
        let lock = store.acquire_lock().await.unwrap();
        drop(lock);
        assert!(!temp_dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(
            temp_dir.path().join(LOCK_FILE),
            r#"{"holder": "old-host", "acquired_at": "2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let store = FileStateStore::new(temp_dir.path());
        assert!(store.acquire_lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStateStore::new();
        let address = ResourceAddress::new("network", "vpc");

        assert_eq!(store.save(&record("network", "vpc")).await.unwrap(), 1);
        assert!(store.save(&record("network", "vpc")).await.is_err());
        assert!(store.delete(&address, 0).await.is_err());

        store.delete(&address, 1).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_dependency_map_skips_unrecorded() {
        let snapshot = StateSnapshot::from_records([
            record("network", "vpc"),
            record("db", "mysql").with_dependencies([
                ResourceAddress::new("network", "vpc"),
                ResourceAddress::new("network", "gone"),
            ]),
        ]);

        let deps = snapshot.dependency_map();
        let mysql = &deps[&ResourceAddress::new("db", "mysql")];
        assert_eq!(mysql.len(), 1);
        assert!(mysql.contains(&ResourceAddress::new("network", "vpc")));
    }
}
