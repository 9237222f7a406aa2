//! Desired-state store.
//!
//! The store holds the recorded intent for every site. It is mutated only
//! on a workflow's success path, so after any failure the previous record
//! remains the source of truth.

use async_trait::async_trait;
use cachemgr_common::{CacheMgrError, CacheMgrResult, CacheState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable per-site record of desired caching state.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// Returns the recorded state; a site never committed is disabled.
    async fn get(&self, site_id: &str) -> CacheMgrResult<CacheState>;

    /// Atomically replaces the recorded state. Durable when it returns.
    async fn commit(&self, site_id: &str, state: &CacheState) -> CacheMgrResult<()>;
}

/// On-disk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    site: String,
    updated_at: DateTime<Utc>,
    state: CacheState,
}

/// Store keeping one JSON document per site in a directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    /// Creates a store rooted at `dir`; the directory is created on first commit.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a site's record.
    ///
    /// ASCII letters, digits and `-` are kept; every other byte, `_`
    /// included, becomes `_xx` in hex. Distinct ids never share a file.
    pub fn record_path(&self, site_id: &str) -> PathBuf {
        let mut name = String::with_capacity(site_id.len());
        for byte in site_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.json", name))
    }

    fn read_record(path: &Path, site_id: &str) -> CacheMgrResult<CacheState> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheState::default());
            }
            Err(e) => {
                return Err(CacheMgrError::store(
                    "get",
                    format!("Failed to read state file {}: {}", path.display(), e),
                ))
            }
        };

        let record: StoredRecord = serde_json::from_str(&json).map_err(|e| {
            CacheMgrError::store(
                "get",
                format!("Failed to decode state file {}: {}", path.display(), e),
            )
        })?;

        if record.site != site_id {
            return Err(CacheMgrError::store(
                "get",
                format!(
                    "State file {} belongs to site '{}', not '{}'",
                    path.display(),
                    record.site,
                    site_id
                ),
            ));
        }
        Ok(record.state)
    }

    fn write_record(dir: &Path, path: &Path, record: &StoredRecord) -> CacheMgrResult<()> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            CacheMgrError::store("commit", format!("{} {}: {}", what, path.display(), e))
        };

        fs::create_dir_all(dir).map_err(|e| fail("Failed to create state directory for", &e))?;

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| fail("Failed to encode state for", &e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| fail("Failed to create temporary file for", &e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| fail("Failed to write", &e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| fail("Failed to sync", &e))?;
        tmp.persist(path)
            .map_err(|e| fail("Failed to replace", &e.error))?;
        // The rename itself is durable only once the directory is synced.
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| fail("Failed to sync state directory for", &e))?;
        Ok(())
    }
}

#[async_trait]
impl DesiredStateStore for JsonStateStore {
    async fn get(&self, site_id: &str) -> CacheMgrResult<CacheState> {
        let path = self.record_path(site_id);
        let site_id = site_id.to_string();
        tokio::task::spawn_blocking(move || Self::read_record(&path, &site_id))
            .await
            .map_err(|e| CacheMgrError::store("get", e.to_string()))?
    }

    async fn commit(&self, site_id: &str, state: &CacheState) -> CacheMgrResult<()> {
        let path = self.record_path(site_id);
        let dir = self.dir.clone();
        let record = StoredRecord {
            site: site_id.to_string(),
            updated_at: Utc::now(),
            state: state.clone(),
        };
        debug!(site = %site_id, path = %path.display(), enabled = state.enabled, "Committing desired state");
        tokio::task::spawn_blocking(move || Self::write_record(&dir, &path, &record))
            .await
            .map_err(|e| CacheMgrError::store("commit", e.to_string()))?
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: parking_lot::RwLock<HashMap<String, CacheState>>,
    commits: parking_lot::Mutex<u64>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a state without counting it as a commit.
    pub fn seed(&self, site_id: &str, state: CacheState) {
        self.states.write().insert(site_id.to_string(), state);
    }

    /// Number of commits so far.
    pub fn commit_count(&self) -> u64 {
        *self.commits.lock()
    }
}

#[async_trait]
impl DesiredStateStore for MemoryStateStore {
    async fn get(&self, site_id: &str) -> CacheMgrResult<CacheState> {
        Ok(self.states.read().get(site_id).cloned().unwrap_or_default())
    }

    async fn commit(&self, site_id: &str, state: &CacheState) -> CacheMgrResult<()> {
        self.states
            .write()
            .insert(site_id.to_string(), state.clone());
        *self.commits.lock() += 1;
        Ok(())
    }
}
