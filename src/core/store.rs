use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::StoreError;
use super::models::{BackupJob, JobId};

/// Source of job definitions and sink for run statistics.
///
/// The core only reads jobs and records successful runs; creating, editing
/// and deleting jobs belongs to whoever owns the store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<BackupJob>>;

    /// Fails with [`StoreError::NotFound`] for unknown ids.
    async fn get_job(&self, id: &str) -> Result<BackupJob>;

    /// Increment `run_count` and set `last_run_at` for one job.
    async fn record_run_success(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Job store held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<Vec<BackupJob>>>,
}

impl MemoryJobStore {
    pub fn new(jobs: Vec<BackupJob>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(jobs)),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_jobs(&self) -> Result<Vec<BackupJob>> {
        Ok(self.jobs.read().await.clone())
    }

    async fn get_job(&self, id: &str) -> Result<BackupJob> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(JobId::from(id)).into())
    }

    async fn record_run_success(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(JobId::from(id)))?;
        job.run_count += 1;
        job.last_run_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(id: &str) -> BackupJob {
        BackupJob {
            id: id.to_string(),
            name: id.to_string(),
            sources: vec![PathBuf::from("/data")],
            destination_root: PathBuf::from("/mnt/dst"),
            schedule_time: "09:00".to_string(),
            schedule_days: Vec::new(),
            notify_emails: Vec::new(),
            last_run_at: None,
            run_count: 0,
        }
    }

    #[tokio::test]
    async fn record_run_success_updates_only_that_job() {
        let store = MemoryJobStore::new(vec![job("a"), job("b")]);
        let at = Utc::now();

        store.record_run_success("b", at).await.unwrap();
        store.record_run_success("b", at).await.unwrap();

        assert_eq!(store.get_job("a").await.unwrap().run_count, 0);
        let b = store.get_job("b").await.unwrap();
        assert_eq!(b.run_count, 2);
        assert_eq!(b.last_run_at, Some(at));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = MemoryJobStore::default();

        let err = store.get_job("missing").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::NotFound("missing".to_string()))
        );

        let err = store.record_run_success("missing", Utc::now()).await.unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }
}
