//! In-memory job repository.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ensure_unique_name;
use crate::core::job::ArchivalJob;
use crate::core::traits::JobRepository;
use crate::error::{ArchiveError, Result};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ArchivalJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<ArchivalJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ArchivalJob>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.name().eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<ArchivalJob>> {
        let mut jobs: Vec<ArchivalJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(jobs)
    }

    async fn create(&self, job: &ArchivalJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id()) {
            return Err(ArchiveError::DuplicateJob(job.name().to_string()));
        }
        ensure_unique_name(jobs.values(), job)?;
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &ArchivalJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id()) {
            return Err(ArchiveError::JobNotFound(job.id().to_string()));
        }
        ensure_unique_name(jobs.values(), job)?;
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::tests::definition;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = MemoryJobStore::new();
        let job = ArchivalJob::new(definition()).unwrap();
        store.create(&job).await.unwrap();

        assert_eq!(store.get_by_id(job.id()).await.unwrap(), Some(job.clone()));
        assert_eq!(
            store.get_by_name("ORDERS-ARCHIVE").await.unwrap().map(|j| j.id()),
            Some(job.id())
        );
        assert!(store.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = MemoryJobStore::new();
        store.create(&ArchivalJob::new(definition()).unwrap()).await.unwrap();

        let err = store
            .create(&ArchivalJob::new(definition()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryJobStore::new();
        let job = ArchivalJob::new(definition()).unwrap();
        assert!(matches!(
            store.update(&job).await.unwrap_err(),
            ArchiveError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_get_due_skips_disabled_and_future() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let due = ArchivalJob::new(definition()).unwrap();

        let mut later_def = definition();
        later_def.name = "later".into();
        let mut later = ArchivalJob::new(later_def).unwrap();
        later.set_next_run_time(Some(now + Duration::minutes(5)));

        let mut off_def = definition();
        off_def.name = "off".into();
        let mut off = ArchivalJob::new(off_def).unwrap();
        off.disable();

        for job in [&due, &later, &off] {
            store.create(job).await.unwrap();
        }

        let ids: Vec<Uuid> = store.get_due(now).await.unwrap().iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![due.id()]);
        assert_eq!(store.get_enabled().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryJobStore::new();
        let job = ArchivalJob::new(definition()).unwrap();
        store.create(&job).await.unwrap();
        assert!(store.delete(job.id()).await.unwrap());
        assert!(!store.delete(job.id()).await.unwrap());
    }
}
