use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::error::{DispatchError, SourceWarning};
use super::models::{BackupJob, JobId, RunOutcome, RunReport};
use super::progress::{RunRecord, RunTracker};
use super::sources;
use super::sync_engine::{SyncEngine, SyncOutcome, SyncProgress};

/// Capacity of the channel between the blocking copy loop and the run task
const ENGINE_CHANNEL_CAPACITY: usize = 64;

/// Starts sync runs and guarantees at most one in-flight run per job.
#[derive(Clone)]
pub struct RunSupervisor {
    engine: Arc<SyncEngine>,
    tracker: RunTracker,
}

impl RunSupervisor {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            tracker: RunTracker::new(),
        }
    }

    /// Start a run for `job` on a new task. Must be called within a Tokio
    /// runtime.
    ///
    /// Fails with `AlreadyRunning` if the job already has a run in flight.
    pub fn start(&self, job: &BackupJob) -> Result<RunHandle, DispatchError> {
        let cancel = CancellationToken::new();
        if !self
            .tracker
            .try_begin(RunRecord::new(job.id.clone(), cancel.clone()))
        {
            return Err(DispatchError::AlreadyRunning(job.id.clone()));
        }

        let guard = InFlightGuard {
            tracker: self.tracker.clone(),
            job_id: job.id.clone(),
        };
        let started_at = Utc::now();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        let handle_job_id = job.id.clone();
        let engine = self.engine.clone();
        let tracker = self.tracker.clone();
        let job = job.clone();
        let token = cancel.clone();
        let span = info_span!("sync_run", job_id = %job.id, job = %job.name);

        tokio::spawn(
            async move {
                info!(sources = job.sources.len(), "Starting run");

                let (outcome, warnings) =
                    execute(&engine, &job, token, &tracker, progress_tx).await;

                match &outcome {
                    RunOutcome::Success { .. } => info!(detail = %outcome.detail(), "Run succeeded"),
                    RunOutcome::Cancelled { .. } => info!(detail = %outcome.detail(), "Run cancelled"),
                    RunOutcome::Failure { reason } => error!(error = %reason, "Run failed"),
                }

                let report = RunReport {
                    job_id: job.id.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                    warnings,
                };

                // Free the job id before the caller sees the result
                drop(guard);
                let _ = completion_tx.send(report);
            }
            .instrument(span),
        );

        Ok(RunHandle {
            job_id: handle_job_id,
            started_at,
            cancel,
            progress: progress_rx,
            completion: completion_rx,
        })
    }

    /// Request cooperative cancellation of a job's run by id.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.tracker.cancel(job_id)
    }

    pub fn cancel_all(&self) {
        self.tracker.cancel_all();
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.tracker.is_active(job_id)
    }

    pub fn active_runs(&self) -> Vec<RunRecord> {
        self.tracker.get_all()
    }

    pub fn active_count(&self) -> usize {
        self.tracker.active_count()
    }

    /// Progress snapshot of a job's in-flight run.
    pub fn run_state(&self, job_id: &str) -> Option<RunRecord> {
        self.tracker.get(job_id)
    }
}

async fn execute(
    engine: &SyncEngine,
    job: &BackupJob,
    cancel: CancellationToken,
    tracker: &RunTracker,
    progress_tx: mpsc::UnboundedSender<SyncProgress>,
) -> (RunOutcome, Vec<SourceWarning>) {
    let resolved = match sources::resolve(&job.sources, &job.backup_root()) {
        Ok(resolved) => resolved,
        Err(e) => {
            let warnings = job
                .sources
                .iter()
                .cloned()
                .map(SourceWarning::Missing)
                .collect();
            return (
                RunOutcome::Failure {
                    reason: e.to_string(),
                },
                warnings,
            );
        }
    };

    for warning in &resolved.warnings {
        warn!(warning = %warning, "Run proceeding without source entry");
    }

    let (engine_tx, mut engine_rx) = mpsc::channel::<SyncProgress>(ENGINE_CHANNEL_CAPACITY);

    let forward = async {
        while let Some(progress) = engine_rx.recv().await {
            tracker.update(&job.id, |record| {
                record.total_files = progress.total_files;
                record.files_copied = progress.files_copied;
                record.percent = progress.percent;
                record.current_file = Some(progress.current_file.clone());
            });
            // The caller may have stopped listening; the run goes on
            let _ = progress_tx.send(progress);
        }
    };

    let (result, ()) = tokio::join!(engine.run(resolved.tasks, cancel, engine_tx), forward);

    let outcome = match result {
        Ok(SyncOutcome::Completed(summary)) => RunOutcome::Success {
            files_copied: summary.files_copied,
            total_files: summary.total_files,
        },
        Ok(SyncOutcome::Cancelled(summary)) => RunOutcome::Cancelled {
            files_copied: summary.files_copied,
            total_files: summary.total_files,
        },
        Err(e) => RunOutcome::Failure {
            reason: e.to_string(),
        },
    };

    (outcome, resolved.warnings)
}

/// Clears the job's in-flight entry, including when the run task panics.
struct InFlightGuard {
    tracker: RunTracker,
    job_id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.job_id);
    }
}

/// Caller's side of a started run: a progress stream plus one terminal report.
pub struct RunHandle {
    job_id: JobId,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    progress: mpsc::UnboundedReceiver<SyncProgress>,
    completion: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Request cooperative cancellation; the engine stops before its next file.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next progress event, or `None` once the run has stopped copying.
    pub async fn recv_progress(&mut self) -> Option<SyncProgress> {
        self.progress.recv().await
    }

    /// Wait for the terminal report.
    pub async fn wait(self) -> RunReport {
        match self.completion.await {
            Ok(report) => report,
            Err(_) => RunReport {
                job_id: self.job_id,
                started_at: self.started_at,
                finished_at: Utc::now(),
                outcome: RunOutcome::Failure {
                    reason: "run task terminated unexpectedly".to_string(),
                },
                warnings: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn job(id: &str, sources: Vec<std::path::PathBuf>, destination: &Path) -> BackupJob {
        BackupJob {
            id: id.to_string(),
            name: format!("job {}", id),
            sources,
            destination_root: destination.to_path_buf(),
            schedule_time: "09:00".to_string(),
            schedule_days: vec!["Monday".to_string()],
            notify_emails: Vec::new(),
            last_run_at: None,
            run_count: 0,
        }
    }

    fn source_tree(root: &Path, files: usize) -> std::path::PathBuf {
        let source = root.join("src");
        fs::create_dir_all(&source).unwrap();
        for i in 0..files {
            fs::write(source.join(format!("file{}.txt", i)), format!("content {}", i)).unwrap();
        }
        source
    }

    #[tokio::test]
    async fn second_start_for_same_job_is_rejected_until_completion() {
        let temp = tempdir().unwrap();
        let source = source_tree(temp.path(), 3);
        let job = job("job-1", vec![source], &temp.path().join("dst"));
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        let handle = supervisor.start(&job).unwrap();
        assert!(supervisor.is_running("job-1"));
        assert_eq!(
            supervisor.start(&job).err(),
            Some(DispatchError::AlreadyRunning("job-1".to_string()))
        );

        let report = handle.wait().await;
        assert!(report.outcome.is_success());
        assert!(!supervisor.is_running("job-1"));

        let again = supervisor.start(&job).unwrap();
        let report = again.wait().await;
        assert_eq!(
            report.outcome,
            RunOutcome::Success {
                files_copied: 0,
                total_files: 3
            }
        );
    }

    #[tokio::test]
    async fn different_jobs_run_concurrently() {
        let temp = tempdir().unwrap();
        let source = source_tree(temp.path(), 2);
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        let a = supervisor
            .start(&job("a", vec![source.clone()], &temp.path().join("dst-a")))
            .unwrap();
        let b = supervisor
            .start(&job("b", vec![source], &temp.path().join("dst-b")))
            .unwrap();
        assert_eq!(supervisor.active_runs().len(), 2);

        assert!(a.wait().await.outcome.is_success());
        assert!(b.wait().await.outcome.is_success());
        assert!(temp.path().join("dst-a/backup/file0.txt").exists());
        assert!(temp.path().join("dst-b/backup/file1.txt").exists());
    }

    #[tokio::test]
    async fn cancel_before_first_file_copies_nothing() {
        let temp = tempdir().unwrap();
        let source = source_tree(temp.path(), 4);
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        // Current-thread runtime: the run task has not been polled yet
        let handle = supervisor.start(&job("job-1", vec![source], &temp.path().join("dst"))).unwrap();
        handle.cancel();

        let report = handle.wait().await;
        assert_eq!(
            report.outcome,
            RunOutcome::Cancelled {
                files_copied: 0,
                total_files: 4
            }
        );
        assert!(!temp.path().join("dst/backup").exists());
        assert!(!supervisor.is_running("job-1"));
    }

    #[tokio::test]
    async fn cancel_by_job_id() {
        let temp = tempdir().unwrap();
        let source = source_tree(temp.path(), 2);
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        let handle = supervisor.start(&job("job-1", vec![source], &temp.path().join("dst"))).unwrap();
        assert!(supervisor.cancel("job-1"));
        assert!(!supervisor.cancel("job-2"));

        assert_eq!(handle.wait().await.outcome.label(), "cancelled");
    }

    #[tokio::test]
    async fn missing_sources_fail_the_run() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("nowhere");
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        let handle = supervisor
            .start(&job("job-1", vec![missing.clone()], &temp.path().join("dst")))
            .unwrap();
        let report = handle.wait().await;

        assert!(matches!(report.outcome, RunOutcome::Failure { .. }));
        assert_eq!(report.warnings, vec![SourceWarning::Missing(missing)]);
        assert!(!supervisor.is_running("job-1"));
    }

    #[tokio::test]
    async fn progress_is_forwarded_in_order() {
        let temp = tempdir().unwrap();
        let source = source_tree(temp.path(), 4);
        let supervisor = RunSupervisor::new(SyncEngine::new(false));

        let mut handle = supervisor.start(&job("job-1", vec![source], &temp.path().join("dst"))).unwrap();

        let mut percents = Vec::new();
        while let Some(progress) = handle.recv_progress().await {
            percents.push(progress.percent);
        }
        assert_eq!(percents, vec![25, 50, 75, 100]);

        let report = handle.wait().await;
        assert_eq!(
            report.outcome,
            RunOutcome::Success {
                files_copied: 4,
                total_files: 4
            }
        );
    }
}
