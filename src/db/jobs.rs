use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::{BackupJob, StoreError};
use tokio_rusqlite::rusqlite::OptionalExtension;

const SELECT_JOBS: &str = "SELECT id, name, destination_root, schedule_time, schedule_days,
                                  last_run_at, run_count
                           FROM backup_jobs";

/// A job as stored, before timestamp parsing.
struct JobRow {
    id: String,
    name: String,
    destination_root: String,
    schedule_time: String,
    schedule_days: String,
    last_run_at: Option<String>,
    run_count: i64,
    sources: Vec<String>,
    emails: Vec<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            destination_root: row.get(2)?,
            schedule_time: row.get(3)?,
            schedule_days: row.get(4)?,
            last_run_at: row.get(5)?,
            run_count: row.get(6)?,
            sources: Vec::new(),
            emails: Vec::new(),
        })
    }

    fn load_children(&mut self, c: &rusqlite::Connection) -> rusqlite::Result<()> {
        self.sources = load_list(
            c,
            "SELECT path FROM job_sources WHERE job_id = ?1 ORDER BY position",
            &self.id,
        )?;
        self.emails = load_list(
            c,
            "SELECT email FROM job_emails WHERE job_id = ?1 ORDER BY position",
            &self.id,
        )?;
        Ok(())
    }

    fn into_job(self) -> Result<BackupJob> {
        let last_run_at = self
            .last_run_at
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("Invalid last_run_at {:?} for job {}", ts, self.id))
            })
            .transpose()?;

        Ok(BackupJob {
            schedule_days: split_days(&self.schedule_days),
            id: self.id,
            name: self.name,
            sources: self.sources.into_iter().map(PathBuf::from).collect(),
            destination_root: PathBuf::from(self.destination_root),
            schedule_time: self.schedule_time,
            notify_emails: self.emails,
            last_run_at,
            run_count: u64::try_from(self.run_count).unwrap_or(0),
        })
    }
}

fn load_list(c: &rusqlite::Connection, sql: &str, job_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = c.prepare_cached(sql)?;
    let rows = stmt.query_map(params![job_id], |row| row.get(0))?;
    rows.collect()
}

/// Days are stored comma-separated; blank entries are dropped.
fn split_days(days: &str) -> Vec<String> {
    days.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

fn insert_children(tx: &rusqlite::Transaction<'_>, job: &BackupJob) -> rusqlite::Result<()> {
    for (position, source) in job.sources.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_sources (job_id, position, path) VALUES (?1, ?2, ?3)",
            params![&job.id, position as i64, source.to_string_lossy().into_owned()],
        )?;
    }

    for (position, email) in job.notify_emails.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_emails (job_id, position, email) VALUES (?1, ?2, ?3)",
            params![&job.id, position as i64, email],
        )?;
    }
    Ok(())
}

pub async fn create(conn: &Connection, job: BackupJob) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO backup_jobs (id, name, destination_root, schedule_time, schedule_days,
                                      last_run_at, run_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &job.id,
                &job.name,
                job.destination_root.to_string_lossy().into_owned(),
                &job.schedule_time,
                job.schedule_days.join(","),
                job.last_run_at.map(|ts| ts.to_rfc3339()),
                job.run_count as i64,
            ],
        )?;

        insert_children(&tx, &job)?;
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn list(conn: &Connection) -> Result<Vec<BackupJob>> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare(&format!("{} ORDER BY created_at, id", SELECT_JOBS))?;
            let mut rows = stmt
                .query_map([], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for row in &mut rows {
                row.load_children(c)?;
            }
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .context("Failed to list jobs")?;

    rows.into_iter().map(JobRow::into_job).collect()
}

pub async fn get(conn: &Connection, job_id: String) -> Result<BackupJob> {
    let lookup_id = job_id.clone();
    let row = conn
        .call(move |c| {
            let row = c
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_JOBS),
                    params![lookup_id],
                    JobRow::from_row,
                )
                .optional()?;
            match row {
                Some(mut row) => {
                    row.load_children(c)?;
                    Ok::<_, rusqlite::Error>(Some(row))
                }
                None => Ok(None),
            }
        })
        .await
        .context("Failed to get job")?;

    match row {
        Some(row) => row.into_job(),
        None => Err(StoreError::NotFound(job_id).into()),
    }
}

/// Replace a job's definition. Run statistics are left as stored.
pub async fn update(conn: &Connection, job: BackupJob) -> Result<()> {
    let job_id = job.id.clone();
    let found = conn
        .call(move |c| -> rusqlite::Result<bool> {
            let tx = c.transaction()?;

            let changed = tx.execute(
                "UPDATE backup_jobs
                 SET name = ?2, destination_root = ?3, schedule_time = ?4, schedule_days = ?5
                 WHERE id = ?1",
                params![
                    &job.id,
                    &job.name,
                    job.destination_root.to_string_lossy().into_owned(),
                    &job.schedule_time,
                    job.schedule_days.join(","),
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            tx.execute("DELETE FROM job_sources WHERE job_id = ?1", params![&job.id])?;
            tx.execute("DELETE FROM job_emails WHERE job_id = ?1", params![&job.id])?;
            insert_children(&tx, &job)?;

            tx.commit()?;
            Ok(true)
        })
        .await
        .context("Failed to update job")?;

    if !found {
        return Err(StoreError::NotFound(job_id).into());
    }
    Ok(())
}

/// Bump `run_count` and set `last_run_at` in a single statement.
pub async fn record_run_success(conn: &Connection, job_id: String, at: DateTime<Utc>) -> Result<()> {
    let update_id = job_id.clone();
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE backup_jobs
                 SET last_run_at = ?2, run_count = run_count + 1
                 WHERE id = ?1",
                params![update_id, at.to_rfc3339()],
            )
        })
        .await
        .context("Failed to record run")?;

    if changed == 0 {
        return Err(StoreError::NotFound(job_id).into());
    }
    Ok(())
}

/// Delete a job and its sources/emails. Returns false if it did not exist.
pub async fn delete(conn: &Connection, job_id: String) -> Result<bool> {
    let changed = conn
        .call(move |c| c.execute("DELETE FROM backup_jobs WHERE id = ?1", params![job_id]))
        .await
        .context("Failed to delete job")?;
    Ok(changed > 0)
}
