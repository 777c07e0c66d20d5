use filetime::FileTime;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info};

use super::error::SyncError;
use super::sources::CopyTask;
use crate::logging::LogThrottle;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Minimum spacing between per-file progress debug logs
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Progress event, emitted after every copied file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    /// `files_copied * 100 / total_files`, rounded down, capped at 100.
    pub percent: u8,
    pub current_file: PathBuf,
    pub files_copied: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Denominator from the pre-scan.
    pub total_files: u64,
    pub files_copied: u64,
    /// Files left alone because the destination was already up to date.
    pub files_skipped: u64,
    pub bytes_copied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    Cancelled(SyncSummary),
}

impl SyncOutcome {
    pub fn summary(&self) -> &SyncSummary {
        match self {
            Self::Completed(s) | Self::Cancelled(s) => s,
        }
    }
}

/// Incremental copy-if-newer engine.
///
/// A file is copied when the destination is missing or the source's
/// modification time is strictly newer than the destination's. Copies keep
/// the source's timestamps so the next run sees them as up to date.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

impl SyncEngine {
    pub fn new(sync_files: bool) -> Self {
        Self { sync_files }
    }

    /// Run `tasks` to completion, cancellation, or the first I/O error.
    ///
    /// The cancel token is checked before every file. Progress is sent on
    /// `tx`; a closed receiver is ignored.
    pub async fn run(
        &self,
        tasks: Vec<CopyTask>,
        cancel: CancellationToken,
        tx: mpsc::Sender<SyncProgress>,
    ) -> Result<SyncOutcome, SyncError> {
        let sync_files = self.sync_files;
        let span = Span::current();

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            run_blocking(&tasks, cancel, tx, sync_files)
        })
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?
    }
}

fn run_blocking(
    tasks: &[CopyTask],
    cancel: CancellationToken,
    tx: mpsc::Sender<SyncProgress>,
    sync_files: bool,
) -> Result<SyncOutcome, SyncError> {
    let start_time = Instant::now();

    // Phase 1: count files for a stable progress denominator
    let mut total_files = 0;
    for task in tasks {
        total_files += match task {
            CopyTask::File { .. } => 1,
            CopyTask::Tree { source, .. } => count_files(source)?,
        };
    }
    info!(tasks = tasks.len(), total_files, "Scan complete");

    let mut pass = CopyPass {
        summary: SyncSummary {
            total_files,
            ..Default::default()
        },
        last_percent: 0,
        last_file: PathBuf::new(),
        sync_files,
        cancel,
        tx,
        throttle: LogThrottle::new(PROGRESS_LOG_INTERVAL),
    };

    // Phase 2: copy, one source entry at a time
    if total_files > 0 {
        for task in tasks {
            debug!(source = %task.source().display(), "Copying source entry");
            let flow = match task {
                CopyTask::File {
                    source,
                    destination,
                } => pass.visit_file(source, destination)?,
                CopyTask::Tree {
                    source,
                    destination,
                } => pass.visit_tree(source, destination)?,
            };

            if flow.is_break() {
                info!(
                    files_copied = pass.summary.files_copied,
                    total_files, "Sync cancelled"
                );
                return Ok(SyncOutcome::Cancelled(pass.summary));
            }
        }
    }

    pass.finish();

    info!(
        files_copied = pass.summary.files_copied,
        files_skipped = pass.summary.files_skipped,
        bytes_copied = pass.summary.bytes_copied,
        duration_ms = start_time.elapsed().as_millis() as u64,
        "Sync complete"
    );

    Ok(SyncOutcome::Completed(pass.summary))
}

/// State of the copy phase.
struct CopyPass {
    summary: SyncSummary,
    last_percent: u8,
    last_file: PathBuf,
    sync_files: bool,
    cancel: CancellationToken,
    tx: mpsc::Sender<SyncProgress>,
    throttle: LogThrottle,
}

impl CopyPass {
    fn visit_tree(&mut self, source: &Path, destination: &Path) -> Result<ControlFlow<()>, SyncError> {
        let entries = read_dir_sorted(source)?;

        for (path, metadata) in &entries {
            if metadata.is_file() {
                let dest = destination.join(path.file_name().unwrap_or_default());
                if self.visit_file(path, &dest)?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
        }

        for (path, metadata) in &entries {
            if metadata.is_dir() {
                let dest = destination.join(path.file_name().unwrap_or_default());
                if self.visit_tree(path, &dest)?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn visit_file(&mut self, source: &Path, destination: &Path) -> Result<ControlFlow<()>, SyncError> {
        if self.cancel.is_cancelled() {
            return Ok(ControlFlow::Break(()));
        }

        self.last_file = source.to_path_buf();

        if !needs_copy(source, destination)? {
            self.summary.files_skipped += 1;
            debug!(file = %source.display(), "Up to date, skipping");
            return Ok(ControlFlow::Continue(()));
        }

        // Destination directories are created only when a file lands in them
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let bytes = copy_single_file(source, destination, self.sync_files)?;
        self.summary.files_copied += 1;
        self.summary.bytes_copied += bytes;

        let percent = progress_percent(self.summary.files_copied, self.summary.total_files);
        self.emit(percent, source);

        if self.throttle.should_log() {
            debug!(
                file = %source.display(),
                files_copied = self.summary.files_copied,
                total_files = self.summary.total_files,
                percent,
                "Sync progress"
            );
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Close a successful run at 100% even when nothing needed copying.
    fn finish(&mut self) {
        if self.last_percent < 100 {
            let last_file = std::mem::take(&mut self.last_file);
            self.emit(100, &last_file);
        }
    }

    fn emit(&mut self, percent: u8, file: &Path) {
        self.last_percent = percent;
        let _ = self.tx.blocking_send(SyncProgress {
            percent,
            current_file: file.to_path_buf(),
            files_copied: self.summary.files_copied,
            total_files: self.summary.total_files,
        });
    }
}

/// Integer percentage, floor-divided. The denominator may be stale if the
/// tree grew after the scan, hence the cap.
fn progress_percent(copied: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (copied.saturating_mul(100) / total).min(100) as u8
}

/// Directory entries sorted by name. Symlinks and special files are
/// filtered out by the callers through `symlink_metadata`.
fn read_dir_sorted(dir: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>, SyncError> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(dir).map_err(|e| SyncError::io(dir, e))? {
        let entry = entry.map_err(|e| SyncError::io(dir, e))?;
        let path = entry.path();
        let metadata = path.symlink_metadata().map_err(|e| SyncError::io(&path, e))?;
        entries.push((path, metadata));
    }

    entries.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(entries)
}

fn count_files(dir: &Path) -> Result<u64, SyncError> {
    let mut total = 0;
    for (path, metadata) in read_dir_sorted(dir)? {
        if metadata.is_dir() {
            total += count_files(&path)?;
        } else if metadata.is_file() {
            total += 1;
        }
    }
    Ok(total)
}

/// Copy-if-newer: destination missing, or source mtime strictly newer.
fn needs_copy(source: &Path, destination: &Path) -> Result<bool, SyncError> {
    let source_meta = fs::metadata(source).map_err(|e| SyncError::io(source, e))?;

    let dest_meta = match fs::metadata(destination) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(SyncError::io(destination, e)),
    };

    let source_mtime = FileTime::from_last_modification_time(&source_meta);
    let dest_mtime = FileTime::from_last_modification_time(&dest_meta);
    Ok(source_mtime > dest_mtime)
}

/// Copy a single file with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, SyncError> {
    let source_metadata = fs::metadata(source).map_err(|e| SyncError::io(source, e))?;

    let source_file = File::open(source).map_err(|e| SyncError::io(source, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    // A previous copy may carry a read-only mode from its source
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::io(dest, e)),
    }

    let dest_file = File::create(dest).map_err(|e| SyncError::io(dest, e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| SyncError::io(source, e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| SyncError::io(dest, e))?;
        bytes_written += bytes_read as u64;
    }

    let inner = writer
        .into_inner()
        .map_err(|e| SyncError::io(dest, e.into_error()))?;

    if sync_file {
        inner.sync_all().map_err(|e| SyncError::io(dest, e))?;
    }
    drop(inner);

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        // Log but don't fail - permission errors might happen on some filesystems
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    // Change detection on the next run depends on this
    let atime = FileTime::from_last_access_time(&source_metadata);
    let mtime = FileTime::from_last_modification_time(&source_metadata);
    filetime::set_file_times(dest, atime, mtime).map_err(|e| SyncError::io(dest, e))?;

    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set_mtime(path: &Path, secs: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn percent_is_floor_divided_and_capped() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 66);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(4, 3), 100);
    }

    #[test]
    fn needs_copy_when_destination_missing() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("a.txt");
        fs::write(&source, b"a").unwrap();

        assert!(needs_copy(&source, &temp.path().join("missing.txt")).unwrap());
    }

    #[test]
    fn needs_copy_only_when_strictly_newer() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src.txt");
        let dest = temp.path().join("dst.txt");
        fs::write(&source, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        set_mtime(&source, 1_700_000_000);
        set_mtime(&dest, 1_700_000_000);
        assert!(!needs_copy(&source, &dest).unwrap(), "equal mtime is up to date");

        set_mtime(&dest, 1_700_000_100);
        assert!(!needs_copy(&source, &dest).unwrap(), "older source is skipped");

        set_mtime(&source, 1_700_000_200);
        assert!(needs_copy(&source, &dest).unwrap());
    }

    #[test]
    fn count_files_skips_directories_and_recurses() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("file1.txt"), b"hello").unwrap();
        fs::create_dir(temp.path().join("subdir")).unwrap();
        fs::create_dir(temp.path().join("empty")).unwrap();
        fs::write(temp.path().join("subdir/nested.txt"), b"nested").unwrap();

        assert_eq!(count_files(temp.path()).unwrap(), 2);
    }

    #[test]
    fn copy_single_file_preserves_content_and_mtime() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source.txt");
        let dest = temp.path().join("dest.txt");

        let content = b"test file content for copying";
        fs::write(&source, content).unwrap();
        set_mtime(&source, 1_600_000_000);

        let written = copy_single_file(&source, &dest, true).unwrap();
        assert_eq!(written, content.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), content);

        let dest_mtime = FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
        assert_eq!(dest_mtime, FileTime::from_unix_time(1_600_000_000, 0));
    }

    #[cfg(unix)]
    #[test]
    fn recopy_over_read_only_destination() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let source = temp.path().join("readonly.txt");
        let dest = temp.path().join("copy.txt");
        fs::write(&source, b"v1").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o444)).unwrap();
        set_mtime(&source, 1_700_000_000);

        copy_single_file(&source, &dest, false).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        fs::set_permissions(&source, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(&source, b"v2").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o444)).unwrap();
        set_mtime(&source, 1_700_000_100);

        assert!(needs_copy(&source, &dest).unwrap());
        assert_eq!(copy_single_file(&source, &dest, false).unwrap(), 2);
        assert_eq!(fs::read(&dest).unwrap(), b"v2");
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[test]
    fn copy_single_file_reports_missing_source() {
        let temp = tempdir().unwrap();
        let result = copy_single_file(&temp.path().join("nope"), &temp.path().join("out"), false);
        match result {
            Err(SyncError::CopyIo { path, source }) => {
                assert_eq!(path, temp.path().join("nope"));
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("expected CopyIo, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_tree_completes_immediately() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir(&source).unwrap();
        let backup = temp.path().join("dst/backup");

        let (tx, mut rx) = mpsc::channel(8);
        let outcome = SyncEngine::default()
            .run(
                vec![CopyTask::Tree {
                    source,
                    destination: backup.clone(),
                }],
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Completed(SyncSummary::default()));
        assert!(!backup.exists());
        let last = rx.recv().await.unwrap();
        assert_eq!(last.percent, 100);
        assert!(rx.recv().await.is_none());
    }
}
