//! Polling scheduler.
//!
//! Every poll interval the scheduler lists all jobs, asks the due-time
//! evaluator about each one, and dispatches the due ones. A job that is
//! still running forfeits the trigger; nothing is queued for later.

use chrono::{Local, NaiveDateTime, Timelike};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::models::{JobId, RunReport};
use super::orchestrator;
use super::schedule;
use crate::context::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Evaluating,
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_evaluated_at: Option<NaiveDateTime>,
    pub ticks: u64,
}

/// A run started by a tick. `completion` resolves once the run's result has
/// been recorded and notified.
pub struct DispatchedRun {
    pub job_id: JobId,
    pub completion: JoinHandle<RunReport>,
}

/// What one evaluation pass did.
#[derive(Default)]
pub struct TickSummary {
    pub evaluated: usize,
    pub due: usize,
    pub dispatched: Vec<DispatchedRun>,
    /// Due, but a run for the job was still in flight.
    pub skipped_running: usize,
    /// Due, but already dispatched earlier in the same minute.
    pub skipped_repeat: usize,
    pub invalid: usize,
}

pub struct Scheduler {
    ctx: AppContext,
    status: Mutex<SchedulerStatus>,
    /// Minute in which each job was last triggered
    last_triggered: Mutex<HashMap<JobId, NaiveDateTime>>,
}

impl Scheduler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            status: Mutex::new(SchedulerStatus {
                state: SchedulerState::Idle,
                last_evaluated_at: None,
                ticks: 0,
            }),
            last_triggered: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.status).clone()
    }

    /// Poll until a shutdown signal is received. The first tick is immediate.
    ///
    /// Returns the runs whose completion handling (recording and
    /// notification) had not finished when the signal arrived.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Vec<DispatchedRun> {
        let mut interval = tokio::time::interval(self.ctx.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Vec<DispatchedRun> = Vec::new();

        info!(
            poll_interval_secs = self.ctx.config.poll_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick(Local::now().naive_local()).await;
                    if !summary.dispatched.is_empty() {
                        info!(
                            dispatched = summary.dispatched.len(),
                            evaluated = summary.evaluated,
                            "Scheduled runs dispatched"
                        );
                    }
                    pending.retain(|run| !run.completion.is_finished());
                    pending.extend(summary.dispatched);
                }
                _ = shutdown.recv() => {
                    pending.retain(|run| !run.completion.is_finished());
                    info!(pending = pending.len(), "Scheduler shutting down");
                    break;
                }
            }
        }

        pending
    }

    /// One evaluation pass at wall-clock time `now`.
    pub async fn tick(&self, now: NaiveDateTime) -> TickSummary {
        self.set_state(SchedulerState::Evaluating);
        let mut summary = TickSummary::default();

        let jobs = match self.ctx.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to list jobs, skipping tick");
                self.finish_tick(now);
                return summary;
            }
        };

        let minute = truncate_to_minute(now);
        self.forget_older_triggers(minute);

        for job in jobs {
            summary.evaluated += 1;

            match schedule::evaluate(&job, &now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(job_id = %job.id, job = %job.name, error = %e, "Skipping job with invalid schedule");
                    summary.invalid += 1;
                    continue;
                }
            }
            summary.due += 1;

            if !self.claim_trigger(&job.id, minute) {
                debug!(job_id = %job.id, "Already triggered this minute");
                summary.skipped_repeat += 1;
                continue;
            }

            let job_id = job.id.clone();
            info!(job_id = %job_id, job = %job.name, "Job due, starting backup");

            match orchestrator::dispatch(&self.ctx, job) {
                Ok(completion) => summary.dispatched.push(DispatchedRun { job_id, completion }),
                Err(DispatchError::AlreadyRunning(_)) => {
                    warn!(job_id = %job_id, "Previous run still in progress, skipping this trigger");
                    summary.skipped_running += 1;
                }
            }
        }

        self.finish_tick(now);
        summary
    }

    fn set_state(&self, state: SchedulerState) {
        lock(&self.status).state = state;
    }

    fn finish_tick(&self, now: NaiveDateTime) {
        let mut status = lock(&self.status);
        status.state = SchedulerState::Idle;
        status.last_evaluated_at = Some(now);
        status.ticks += 1;
    }

    /// Record that `job_id` fired in `minute`. False if it already did.
    fn claim_trigger(&self, job_id: &str, minute: NaiveDateTime) -> bool {
        let mut triggered = lock(&self.last_triggered);
        if triggered.get(job_id) == Some(&minute) {
            return false;
        }
        triggered.insert(job_id.to_string(), minute);
        true
    }

    fn forget_older_triggers(&self, minute: NaiveDateTime) {
        lock(&self.last_triggered).retain(|_, m| *m == minute);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn truncate_to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}
