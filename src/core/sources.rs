//! Resolution of a job's source entries into copy tasks.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::error::{SourceWarning, SyncError};

/// One unit of work for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyTask {
    /// Copy a single file to `destination` (`<backup>/<basename>`).
    File { source: PathBuf, destination: PathBuf },
    /// Mirror the subtree of `source` below `destination`, preserving
    /// relative paths.
    Tree { source: PathBuf, destination: PathBuf },
}

impl CopyTask {
    pub fn source(&self) -> &Path {
        match self {
            Self::File { source, .. } | Self::Tree { source, .. } => source,
        }
    }
}

/// Output of [`resolve`]: the tasks to run plus warnings for skipped entries.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    pub tasks: Vec<CopyTask>,
    pub warnings: Vec<SourceWarning>,
}

/// Turn an ordered set of source paths into copy tasks rooted at `backup_root`.
///
/// Duplicate entries are collapsed, keeping the first occurrence. Missing
/// entries become warnings; if nothing is left the run cannot proceed.
pub fn resolve(sources: &[PathBuf], backup_root: &Path) -> Result<ResolvedSources, SyncError> {
    let mut resolved = ResolvedSources::default();
    let mut seen: Vec<&Path> = Vec::with_capacity(sources.len());

    for source in sources {
        if seen.contains(&source.as_path()) {
            continue;
        }
        seen.push(source);

        let metadata = match fs::metadata(source) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "Source entry missing, skipping");
                resolved
                    .warnings
                    .push(SourceWarning::Missing(source.clone()));
                continue;
            }
        };

        if metadata.is_dir() {
            resolved.tasks.push(CopyTask::Tree {
                source: source.clone(),
                destination: backup_root.to_path_buf(),
            });
        } else if metadata.is_file() {
            let Some(name) = source.file_name() else {
                resolved
                    .warnings
                    .push(SourceWarning::Missing(source.clone()));
                continue;
            };
            resolved.tasks.push(CopyTask::File {
                source: source.clone(),
                destination: backup_root.join(name),
            });
        } else {
            warn!(path = %source.display(), "Source entry is not a file or directory, skipping");
            resolved
                .warnings
                .push(SourceWarning::Missing(source.clone()));
        }
    }

    if resolved.tasks.is_empty() {
        return Err(SyncError::NoSourcesAvailable);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolves_files_and_directories_in_order() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("photos");
        let file = temp.path().join("notes.txt");
        fs::create_dir(&dir).unwrap();
        fs::write(&file, b"notes").unwrap();
        let backup = temp.path().join("dst/backup");

        let resolved = resolve(&[file.clone(), dir.clone()], &backup).unwrap();

        assert!(resolved.warnings.is_empty());
        assert_eq!(
            resolved.tasks,
            vec![
                CopyTask::File {
                    source: file,
                    destination: backup.join("notes.txt"),
                },
                CopyTask::Tree {
                    source: dir,
                    destination: backup.clone(),
                },
            ]
        );
        // Nothing is created during resolution.
        assert!(!backup.exists());
    }

    #[test]
    fn missing_entries_become_warnings() {
        let temp = tempdir().unwrap();
        let present = temp.path().join("present.txt");
        let missing = temp.path().join("gone.txt");
        fs::write(&present, b"x").unwrap();

        let resolved = resolve(&[missing.clone(), present.clone()], temp.path()).unwrap();

        assert_eq!(resolved.tasks.len(), 1);
        assert_eq!(resolved.tasks[0].source(), present.as_path());
        assert_eq!(resolved.warnings, vec![SourceWarning::Missing(missing)]);
    }

    #[test]
    fn all_missing_is_an_error() {
        let temp = tempdir().unwrap();
        let result = resolve(&[temp.path().join("a"), temp.path().join("b")], temp.path());
        assert!(matches!(result, Err(SyncError::NoSourcesAvailable)));

        let result = resolve(&[], temp.path());
        assert!(matches!(result, Err(SyncError::NoSourcesAvailable)));
    }

    #[test]
    fn duplicate_entries_are_collapsed() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, b"a").unwrap();

        let resolved = resolve(&[file.clone(), file.clone()], temp.path()).unwrap();
        assert_eq!(resolved.tasks.len(), 1);
    }
}
