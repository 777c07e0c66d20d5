use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::models::{BackupJob, RunOutcome, RunReport};
use super::notifications::RunNotification;
use super::scheduler::{DispatchedRun, Scheduler};
use super::supervisor::RunHandle;
use crate::context::AppContext;
use crate::logging::LogThrottle;

/// Spacing between progress lines in the daemon log
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// How long shutdown waits for dispatched runs to be recorded and notified
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the scheduler for the lifetime of the daemon process.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run the scheduler until Ctrl-C, then cancel in-flight runs.
    pub async fn start(&self) -> Result<()> {
        info!(
            database = %self.ctx.config.database_path.display(),
            notifications = self.ctx.notifier.is_some(),
            "bkmgr daemon starting"
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(self.ctx.clone());
        let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown requested");

        let _ = shutdown_tx.send(());
        let pending = scheduler_task.await.context("Scheduler task failed")?;

        for record in self.ctx.supervisor.active_runs() {
            info!(
                job_id = %record.job_id,
                percent = record.percent,
                already_cancelled = record.cancel_requested(),
                "Cancelling in-flight run"
            );
        }
        self.ctx.supervisor.cancel_all();

        let unfinished = drain_runs(pending, SHUTDOWN_GRACE).await;
        if unfinished > 0 {
            warn!(
                unfinished,
                active = self.ctx.supervisor.active_count(),
                "Runs still completing at shutdown"
            );
        }

        info!("bkmgr daemon stopped");
        Ok(())
    }
}

/// Wait up to `grace` for dispatched runs to be recorded and notified.
/// Returns how many had not finished by then.
pub async fn drain_runs(runs: Vec<DispatchedRun>, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    let mut unfinished = 0;

    for run in runs {
        match tokio::time::timeout_at(deadline, run.completion).await {
            Ok(Ok(report)) => {
                debug!(job_id = %run.job_id, outcome = report.outcome.label(), "Run completed during shutdown")
            }
            Ok(Err(e)) => error!(job_id = %run.job_id, error = %e, "Completion task failed"),
            Err(_) => unfinished += 1,
        }
    }

    unfinished
}

/// Start a run for `job` and hand its completion to a background task that
/// records the result and notifies recipients.
pub fn dispatch(ctx: &AppContext, job: BackupJob) -> Result<JoinHandle<RunReport>, DispatchError> {
    let handle = ctx.supervisor.start(&job)?;
    let ctx = ctx.clone();

    Ok(tokio::spawn(async move {
        let report = follow_run(handle).await;
        complete_run(&ctx, &job, &report).await;
        report
    }))
}

/// Log a run's progress until it ends and return its report.
pub async fn follow_run(mut handle: RunHandle) -> RunReport {
    let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);

    while let Some(progress) = handle.recv_progress().await {
        if progress.percent == 100 || throttle.should_log() {
            info!(
                job_id = %handle.job_id(),
                percent = progress.percent,
                files_copied = progress.files_copied,
                total_files = progress.total_files,
                file = %progress.current_file.display(),
                "Backup progress"
            );
        }
    }

    handle.wait().await
}

/// Caller-side handling of a terminal report: update run statistics on
/// success, then notify the job's recipients. Failures here are logged and
/// never change the run's outcome.
pub async fn complete_run(ctx: &AppContext, job: &BackupJob, report: &RunReport) {
    if report.outcome.is_success() {
        if let Err(e) = ctx
            .store
            .record_run_success(&report.job_id, report.finished_at)
            .await
        {
            error!(job_id = %report.job_id, error = %format!("{:#}", e), "Failed to record run");
        }
    }

    if matches!(report.outcome, RunOutcome::Cancelled { .. }) {
        return;
    }

    let Some(notifier) = &ctx.notifier else {
        return;
    };
    if job.notify_emails.is_empty() {
        return;
    }

    let notification = RunNotification {
        job_name: job.name.clone(),
        recipients: job.notify_emails.clone(),
        success: report.outcome.is_success(),
        detail: report.outcome.detail(),
    };

    if let Err(e) = notifier.notify(&notification).await {
        warn!(job_id = %job.id, error = %format!("{:#}", e), "Notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::notifications::Notifier;
    use crate::core::{JobStore, MemoryJobStore};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<RunNotification>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &RunNotification) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                anyhow::bail!("smtp unreachable");
            }
            Ok(())
        }
    }

    fn job(sources: Vec<PathBuf>, destination: PathBuf) -> BackupJob {
        BackupJob {
            id: "job-1".to_string(),
            name: "Documents".to_string(),
            sources,
            destination_root: destination,
            schedule_time: "09:00".to_string(),
            schedule_days: vec!["Monday".to_string()],
            notify_emails: vec!["ops@example.com".to_string()],
            last_run_at: None,
            run_count: 0,
        }
    }

    fn context(job: &BackupJob, notifier: Arc<RecordingNotifier>) -> (AppContext, MemoryJobStore) {
        let store = MemoryJobStore::new(vec![job.clone()]);
        let ctx = AppContext::new(AppConfig::default(), Arc::new(store.clone()), Some(notifier));
        (ctx, store)
    }

    #[tokio::test]
    async fn success_is_recorded_and_notified() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let job = job(vec![source], temp.path().join("dst"));
        let notifier = Arc::new(RecordingNotifier::default());
        let (ctx, store) = context(&job, notifier.clone());

        let report = dispatch(&ctx, job).unwrap().await.unwrap();
        assert!(report.outcome.is_success());

        let stored = store.get_job("job-1").await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_run_at, Some(report.finished_at));

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].success);
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn failure_is_notified_but_not_recorded() {
        let temp = tempfile::tempdir().unwrap();
        let job = job(vec![temp.path().join("missing")], temp.path().join("dst"));
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let (ctx, store) = context(&job, notifier.clone());

        let report = dispatch(&ctx, job).unwrap().await.unwrap();
        assert!(matches!(report.outcome, RunOutcome::Failure { .. }));

        let stored = store.get_job("job-1").await.unwrap();
        assert_eq!(stored.run_count, 0);
        assert!(stored.last_run_at.is_none());

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].success);
    }

    #[tokio::test]
    async fn cancelled_run_is_neither_recorded_nor_notified() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let job = job(vec![source], temp.path().join("dst"));
        let notifier = Arc::new(RecordingNotifier::default());
        let (ctx, store) = context(&job, notifier.clone());

        let completion = dispatch(&ctx, job).unwrap();
        assert!(ctx.supervisor.cancel("job-1"));
        let report = completion.await.unwrap();

        assert_eq!(report.outcome.label(), "cancelled");
        assert_eq!(store.get_job("job-1").await.unwrap().run_count, 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_drain_waits_for_recording_and_notification() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let job = job(vec![source], temp.path().join("dst"));
        let notifier = Arc::new(RecordingNotifier {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let (ctx, store) = context(&job, notifier.clone());

        let completion = dispatch(&ctx, job).unwrap();
        while ctx.supervisor.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The in-flight set is empty, but the notifier is still sleeping
        assert!(notifier.sent.lock().unwrap().is_empty());

        let runs = vec![DispatchedRun {
            job_id: "job-1".to_string(),
            completion,
        }];
        assert_eq!(drain_runs(runs, Duration::from_secs(10)).await, 0);

        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(store.get_job("job-1").await.unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn shutdown_drain_gives_up_after_grace() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let job = job(vec![source], temp.path().join("dst"));
        let notifier = Arc::new(RecordingNotifier {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let (ctx, _store) = context(&job, notifier);

        let runs = vec![DispatchedRun {
            job_id: "job-1".to_string(),
            completion: dispatch(&ctx, job).unwrap(),
        }];
        assert_eq!(drain_runs(runs, Duration::from_millis(50)).await, 1);
    }
}
