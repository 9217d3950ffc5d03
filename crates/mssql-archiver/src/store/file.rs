//! JSON file job repository.
//!
//! The whole store is one document. Every mutation reads it, applies the
//! change and writes a temp file that is renamed over the original, so a
//! crash mid-write leaves the previous version intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::ensure_unique_name;
use crate::core::job::ArchivalJob;
use crate::core::traits::JobRepository;
use crate::error::{ArchiveError, Result};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    jobs: Vec<ArchivalJob>,
}

pub struct FileJobStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreDocument> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument {
                    version: STORE_VERSION,
                    jobs: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let doc: StoreDocument = serde_json::from_str(&content)?;
        if doc.version > STORE_VERSION {
            return Err(ArchiveError::Store(format!(
                "{} was written by a newer version (format {})",
                self.path.display(),
                doc.version
            )));
        }
        for job in &doc.jobs {
            job.definition().validate_stored().map_err(|e| {
                ArchiveError::Store(format!("stored job '{}' is invalid: {}", job.name(), e))
            })?;
        }
        Ok(doc)
    }

    async fn write(&self, doc: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(doc)?;

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for FileJobStore {
    async fn init(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&self.path).await? {
            self.read().await.map(|_| ())
        } else {
            self.write(&StoreDocument {
                version: STORE_VERSION,
                jobs: Vec::new(),
            })
            .await
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArchivalJob>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.jobs.into_iter().find(|j| j.id() == id))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ArchivalJob>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read()
            .await?
            .jobs
            .into_iter()
            .find(|j| j.name().eq_ignore_ascii_case(name)))
    }

    async fn get_all(&self) -> Result<Vec<ArchivalJob>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.jobs)
    }

    async fn create(&self, job: &ArchivalJob) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        if doc.jobs.iter().any(|j| j.id() == job.id()) {
            return Err(ArchiveError::DuplicateJob(job.name().to_string()));
        }
        ensure_unique_name(&doc.jobs, job)?;
        doc.jobs.push(job.clone());
        doc.version = STORE_VERSION;
        self.write(&doc).await
    }

    async fn update(&self, job: &ArchivalJob) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        ensure_unique_name(&doc.jobs, job)?;
        let slot = doc
            .jobs
            .iter_mut()
            .find(|j| j.id() == job.id())
            .ok_or_else(|| ArchiveError::JobNotFound(job.id().to_string()))?;
        *slot = job.clone();
        doc.version = STORE_VERSION;
        self.write(&doc).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        let before = doc.jobs.len();
        doc.jobs.retain(|j| j.id() != id);
        if doc.jobs.len() == before {
            return Ok(false);
        }
        self.write(&doc).await?;
        Ok(true)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::tests::definition;
    use crate::core::job::{ExecutionOutcome, JobStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::new(dir.path().join("jobs.json"));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");
        let store = FileJobStore::new(&path);
        store.init().await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let mut job = ArchivalJob::new(definition()).unwrap();
        {
            let store = FileJobStore::new(&path);
            store.create(&job).await.unwrap();

            let now = Utc::now();
            job.mark_running(now).unwrap();
            job.update_execution_result(ExecutionOutcome::Moved { rows: 42 }, now)
                .unwrap();
            store.update(&job).await.unwrap();
        }

        let reopened = FileJobStore::new(&path);
        let loaded = reopened.get_by_id(job.id()).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.status(), JobStatus::Success);
        assert_eq!(loaded.runtime().total_rows_moved, 42);
        assert!(loaded.runtime().next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::new(dir.path().join("jobs.json"));
        let job = ArchivalJob::new(definition()).unwrap();
        store.create(&job).await.unwrap();

        let twin = ArchivalJob::new(definition()).unwrap();
        assert!(matches!(
            store.create(&twin).await.unwrap_err(),
            ArchiveError::DuplicateJob(_)
        ));
        assert!(matches!(
            store.update(&twin).await.unwrap_err(),
            ArchiveError::DuplicateJob(_)
        ));

        assert!(store.delete(job.id()).await.unwrap());
        assert!(matches!(
            store.update(&job).await.unwrap_err(),
            ArchiveError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileJobStore::new(&path);
        assert!(matches!(
            store.get_all().await.unwrap_err(),
            ArchiveError::Json(_)
        ));
    }
}
