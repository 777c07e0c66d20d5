use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

use super::error::SourceWarning;
use super::schedule::Schedule;

pub type JobId = String;

/// Name of the directory every run writes into, below the destination root.
pub const BACKUP_DIR_NAME: &str = "backup";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
});

/// A configured backup task, as held by the job store.
///
/// Schedule fields are kept in their stored string form; they are parsed
/// on every evaluation so that a bad value only skips that job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: JobId,
    pub name: String,
    pub sources: Vec<PathBuf>,
    pub destination_root: PathBuf,
    /// `HH:MM`, 24-hour.
    pub schedule_time: String,
    /// English weekday names. Empty means never triggered automatically.
    pub schedule_days: Vec<String>,
    pub notify_emails: Vec<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
}

impl BackupJob {
    /// Directory all copies land under: `destination_root/backup`.
    pub fn backup_root(&self) -> PathBuf {
        self.destination_root.join(BACKUP_DIR_NAME)
    }

    /// Check a job definition before it is stored.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.sources.is_empty() {
            problems.push("at least one source is required".to_string());
        }
        for source in &self.sources {
            if !source.is_absolute() {
                problems.push(format!("source {} is not absolute", source.display()));
            }
        }
        if !self.destination_root.is_absolute() {
            problems.push(format!(
                "destination {} is not absolute",
                self.destination_root.display()
            ));
        }
        let backup_root = self.backup_root();
        for source in &self.sources {
            // The walk would copy the backup into itself on every run
            if backup_root.starts_with(source) {
                problems.push(format!(
                    "backup directory {} lies inside source {}",
                    backup_root.display(),
                    source.display()
                ));
            }
        }
        if let Err(e) = Schedule::parse(&self.schedule_time, &self.schedule_days) {
            problems.push(e.to_string());
        }
        for email in &self.notify_emails {
            if !EMAIL_RE.is_match(email) {
                problems.push(format!("invalid email address {:?}", email));
            }
        }

        problems
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { files_copied: u64, total_files: u64 },
    Failure { reason: String },
    Cancelled { files_copied: u64, total_files: u64 },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Human-readable detail accompanying the outcome.
    pub fn detail(&self) -> String {
        match self {
            Self::Success {
                files_copied,
                total_files,
            } => format!("{} of {} file(s) copied", files_copied, total_files),
            Self::Failure { reason } => reason.clone(),
            Self::Cancelled {
                files_copied,
                total_files,
            } => format!(
                "cancelled after {} of {} file(s) copied",
                files_copied, total_files
            ),
        }
    }
}

/// Delivered exactly once per started run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub warnings: Vec<SourceWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BackupJob {
        BackupJob {
            id: "job-1".to_string(),
            name: "Documents".to_string(),
            sources: vec![PathBuf::from("/home/user/docs")],
            destination_root: PathBuf::from("/mnt/backup"),
            schedule_time: "09:00".to_string(),
            schedule_days: vec!["Monday".to_string()],
            notify_emails: vec!["ops@example.com".to_string()],
            last_run_at: None,
            run_count: 0,
        }
    }

    #[test]
    fn backup_root_is_below_destination() {
        assert_eq!(job().backup_root(), PathBuf::from("/mnt/backup/backup"));
    }

    #[test]
    fn valid_job_has_no_problems() {
        assert!(job().validate().is_empty());
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut bad = job();
        bad.name = "  ".to_string();
        bad.sources = vec![PathBuf::from("relative/dir")];
        bad.schedule_time = "25:00".to_string();
        bad.notify_emails = vec!["not-an-address".to_string()];

        let problems = bad.validate();
        assert_eq!(problems.len(), 4, "{:?}", problems);
    }

    #[test]
    fn backup_inside_a_source_is_rejected() {
        let mut nested = job();
        nested.destination_root = PathBuf::from("/home/user/docs/archive");
        let problems = nested.validate();
        assert_eq!(problems.len(), 1, "{:?}", problems);
        assert!(problems[0].contains("inside source /home/user/docs"));

        let mut same = job();
        same.destination_root = PathBuf::from("/home/user/docs");
        assert_eq!(same.validate().len(), 1);

        // Shared prefix without a shared component is fine
        let mut sibling = job();
        sibling.destination_root = PathBuf::from("/home/user/docs-backup");
        assert!(sibling.validate().is_empty());
    }

    #[test]
    fn outcome_detail_mentions_counts() {
        let outcome = RunOutcome::Cancelled {
            files_copied: 2,
            total_files: 5,
        };
        assert_eq!(outcome.detail(), "cancelled after 2 of 5 file(s) copied");
        assert!(!outcome.is_success());
        assert_eq!(outcome.label(), "cancelled");
    }
}
