//! Key-Value Persistence
//!
//! Jobs, batches, cache entries, circuit states and usage counters are
//! persisted through [`KeyValueStore`], one namespace per entity kind. The
//! storage engine is pluggable; two are provided:
//!
//! - [`MemoryStore`]: `DashMap`-backed, the default
//! - [`JsonDirStore`]: one JSON file per key under a directory
//!
//! Values carry an optional TTL. Expired values read as absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;

/// Namespace names
pub mod namespaces {
    /// Job records
    pub const JOBS: &str = "jobs";
    /// Batch records
    pub const BATCHES: &str = "batches";
    /// Cache entries
    pub const CACHE: &str = "cache";
    /// Circuit breaker snapshots
    pub const CIRCUITS: &str = "circuits";
    /// Usage counters
    pub const USAGE: &str = "usage";
}

/// Pluggable key-value collaborator
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if absent or expired
    async fn get(&self, namespace: &str, key: &str)
        -> Result<Option<serde_json::Value>, StoreError>;

    /// Write a value, optionally expiring after `ttl`
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Remove a value
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// Keys present in a namespace (expired keys may be included)
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
}

/// Serialize and store a typed value
pub async fn save<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    namespace: &str,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let json = serde_json::to_value(value).map_err(|source| StoreError::Serde {
        namespace: namespace.to_string(),
        key: key.to_string(),
        source,
    })?;
    store.put(namespace, key, json, ttl).await
}

/// Load and deserialize a typed value
pub async fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(json) = store.get(namespace, key).await? else {
        return Ok(None);
    };
    serde_json::from_value(json)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            namespace: namespace.to_string(),
            key: key.to_string(),
            source,
        })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredValue {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn new(value: serde_json::Value, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        let expires_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
        Self { value, expires_at }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory store
#[derive(Debug)]
pub struct MemoryStore {
    clock: SharedClock,
    data: DashMap<(String, String), StoredValue>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            data: DashMap::new(),
        }
    }

    /// Number of stored values, including expired ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .data
            .get(&(namespace.to_string(), key.to_string()))
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let stored = StoredValue::new(value, ttl, self.clock.now());
        self.data
            .insert((namespace.to_string(), key.to_string()), stored);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.data.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory-backed store: `<root>/<namespace>/<key>.json`
#[derive(Debug)]
pub struct JsonDirStore {
    root: PathBuf,
    clock: SharedClock,
}

impl JsonDirStore {
    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, system_clock())
    }

    /// Store with an explicit clock
    pub fn with_clock(root: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    /// Default location under the user's data directory
    #[must_use]
    pub fn default_root() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("ai-dispatch").join("store"))
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(encode_segment(namespace))
            .join(format!("{}.json", encode_segment(key)))
    }
}

/// Reversible file-name encoding: bytes outside `[A-Za-z0-9.-]` become `_xx`
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
            out.push(char::from(byte));
        } else {
            out.push('_');
            out.push_str(&hex::encode([byte]));
        }
    }
    out
}

fn decode_segment(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut rest = name.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'_' {
            let digits = tail.get(..2)?;
            bytes.extend(hex::decode(digits).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(first);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl KeyValueStore for JsonDirStore {
    async fn get(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.path_for(namespace, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let stored: StoredValue =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
                namespace: namespace.to_string(),
                key: key.to_string(),
                source,
            })?;
        Ok(stored
            .is_live(self.clock.now())
            .then_some(stored.value))
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }
        let stored = StoredValue::new(value, ttl, self.clock.now());
        let bytes = serde_json::to_vec_pretty(&stored).map_err(|source| StoreError::Serde {
            namespace: namespace.to_string(),
            key: key.to_string(),
            source,
        })?;

        // Write-then-rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_err(&path))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(encode_segment(namespace));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(key) = name.strip_suffix(".json").and_then(decode_segment) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
