use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use super::jobs;
use crate::core::{BackupJob, JobStore};

/// `JobStore` backed by the SQLite job table.
///
/// All statements run on the connection's single worker thread, which
/// serializes run-statistic updates with concurrent job edits.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn insert_job(&self, job: BackupJob) -> Result<()> {
        jobs::create(&self.conn, job).await
    }

    pub async fn update_job(&self, job: BackupJob) -> Result<()> {
        jobs::update(&self.conn, job).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        jobs::delete(&self.conn, id.to_string()).await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn list_jobs(&self) -> Result<Vec<BackupJob>> {
        jobs::list(&self.conn).await
    }

    async fn get_job(&self, id: &str) -> Result<BackupJob> {
        jobs::get(&self.conn, id.to_string()).await
    }

    async fn record_run_success(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        jobs::record_run_success(&self.conn, id.to_string(), at).await
    }
}
