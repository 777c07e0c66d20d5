//! In-memory tracking of in-flight runs.
//!
//! The tracker's key set is the set of job ids with an active run. Entries
//! are created atomically on dispatch and removed when the run reaches a
//! terminal state. Nothing here is persisted; only run statistics of
//! successful runs reach the job store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::models::JobId;

/// Live state of one run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub total_files: u64,
    pub files_copied: u64,
    pub percent: u8,
    pub current_file: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl RunRecord {
    pub fn new(job_id: JobId, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            started_at: Utc::now(),
            total_files: 0,
            files_copied: 0,
            percent: 0,
            current_file: None,
            cancel,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Thread-safe table of in-flight runs, keyed by job id.
///
/// A single mutex guards the table, so `try_begin` is an atomic
/// test-and-set.
#[derive(Clone, Default)]
pub struct RunTracker {
    inner: Arc<Mutex<HashMap<JobId, RunRecord>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, RunRecord>> {
        // A panic while holding the lock cannot leave a half-written entry
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a run. Returns false if the job already has one in flight.
    pub fn try_begin(&self, record: RunRecord) -> bool {
        let mut map = self.lock();
        if map.contains_key(&record.job_id) {
            return false;
        }
        map.insert(record.job_id.clone(), record);
        true
    }

    /// Apply a progress update to a job's record, if it is still tracked.
    pub fn update(&self, job_id: &str, update: impl FnOnce(&mut RunRecord)) {
        if let Some(record) = self.lock().get_mut(job_id) {
            update(record);
        }
    }

    /// Get the current state of a specific run.
    pub fn get(&self, job_id: &str) -> Option<RunRecord> {
        self.lock().get(job_id).cloned()
    }

    /// Remove a run (called when it reaches a terminal state).
    pub fn finish(&self, job_id: &str) -> Option<RunRecord> {
        self.lock().remove(job_id)
    }

    /// Request cancellation of a job's run. Returns false if none is in flight.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(record) => {
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for record in self.lock().values() {
            record.cancel.cancel();
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Snapshot of all in-flight runs.
    pub fn get_all(&self) -> Vec<RunRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}
