// Configuration store: durable persistence of the job list
//
// The registry loads once at startup and writes the full list after every
// mutation. A failed save is logged by the caller and never fatal.

use crate::errors::StorageError;
use crate::models::Job;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

const DOCUMENT_VERSION: u32 = 1;

/// ConfigStore persists the ordered job list
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load every job, in stored order
    async fn load(&self) -> Result<Vec<Job>, StorageError>;

    /// Replace the stored list with `jobs`
    async fn save(&self, jobs: &[Job]) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    jobs: Vec<Job>,
}

/// JSON document on the local filesystem, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "jobs.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Vec<Job>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Job store does not exist yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let document: StoreDocument = serde_json::from_slice(&bytes)?;
        if document.version != DOCUMENT_VERSION {
            return Err(StorageError::UnsupportedVersion(document.version));
        }

        debug!(job_count = document.jobs.len(), "Loaded job store");
        Ok(document.jobs)
    }

    #[tracing::instrument(skip(self, jobs), fields(path = %self.path.display(), job_count = jobs.len()))]
    async fn save(&self, jobs: &[Job]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let document = StoreDocument {
            version: DOCUMENT_VERSION,
            jobs: jobs.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!("Job store saved");
        Ok(())
    }
}

/// In-process store, with failure injection for exercising save errors
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<Job>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail until reset
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Snapshot of the last saved list
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Job>, StorageError> {
        Ok(self.snapshot())
    }

    async fn save(&self, jobs: &[Job]) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("save failure injected".to_string()));
        }
        let mut stored = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        *stored = jobs.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, NewJob, Recurrence};
    use chrono::Utc;

    fn job(name: &str) -> Job {
        Job::from_new(
            NewJob::new(
                name,
                Recurrence::new("0 * * * *", chrono_tz::Europe::Berlin),
                Environment::Development,
                Environment::Staging,
            ),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("jobs.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("jobs.json"));
        let jobs = vec![job("first"), job("second"), job("third")];

        store.save(&jobs).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, jobs);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, r#"{"version": 7, "jobs": []}"#)
            .await
            .unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedVersion(7)));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.save(&[job("a")]).await.unwrap();
        assert_eq!(store.save_count(), 1);

        store.set_fail_saves(true);
        assert!(store.save(&[]).await.is_err());
        assert_eq!(store.snapshot().len(), 1);

        store.set_fail_saves(false);
        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
