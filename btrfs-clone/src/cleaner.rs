//! Stray destination cleanup.
//!
//! Subvolumes go first, then directories: a directory cannot be removed while
//! a subvolume still lives under it. Every item is attempted; a failure is
//! reported as a cleanup error and the next item is tried.

use crate::btrfs::Btrfs;
use crate::command::ToolRunner;
use crate::prompt::Console;
use crate::reconcile::Strays;
use crate::transport::Transport;
use crate::utils::{CloneError, ErrorReporter, Result};
use std::collections::BTreeSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

/// What a cleanup pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn merge(&mut self, other: CleanupReport) {
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

pub struct StrayCleaner<'a> {
    runner: &'a ToolRunner,
    btrfs: &'a Btrfs,
    countdown_secs: u64,
    /// Present in interactive runs
    console: Option<&'a Console>,
    cancel: &'a CancellationToken,
}

impl<'a> StrayCleaner<'a> {
    pub fn new(
        runner: &'a ToolRunner,
        btrfs: &'a Btrfs,
        countdown_secs: u64,
        console: Option<&'a Console>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            runner,
            btrfs,
            countdown_secs,
            console,
            cancel,
        }
    }

    /// Delete every stray, subvolumes before directories.
    pub async fn clean(
        &self,
        dst: &dyn Transport,
        strays: &Strays,
        reporter: &mut ErrorReporter,
    ) -> Result<CleanupReport> {
        let mut report = self.delete_subvolumes(dst, &strays.subvolumes, reporter).await?;
        report.merge(self.delete_directories(dst, &strays.directories, reporter).await?);
        Ok(report)
    }

    pub async fn delete_subvolumes(
        &self,
        dst: &dyn Transport,
        paths: &[String],
        reporter: &mut ErrorReporter,
    ) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if paths.is_empty() {
            return Ok(report);
        }

        info!(
            "Deleting {} stray destination subvolume(s) from {}",
            paths.len(),
            dst.origin()
        );
        self.confirm().await?;

        for path in paths {
            let argv = self.btrfs.delete(&dst.tool_path(path));
            match self.runner.mutate(Some(dst), argv).await {
                Ok(true) => {
                    debug!("Deleted subvolume {}/{}", dst.origin(), path);
                    report.deleted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    reporter.report(cleanup_error(path, &e))?;
                }
            }
        }
        Ok(report)
    }

    pub async fn delete_directories(
        &self,
        dst: &dyn Transport,
        names: &[String],
        reporter: &mut ErrorReporter,
    ) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if names.is_empty() {
            return Ok(report);
        }

        info!(
            "Deleting {} stray destination director(y/ies) from {}",
            names.len(),
            dst.origin()
        );
        self.confirm().await?;

        for name in names {
            let path = dst.local_path(name);
            if self.runner.dry_run() {
                info!("(--dry-run) NOT removing directory {}", path.display());
                continue;
            }
            match tokio::fs::remove_dir(&path).await {
                Ok(()) => {
                    debug!("Deleted directory {}", path.display());
                    report.deleted += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    reporter.report(CloneError::Cleanup {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(report)
    }

    /// Remove what an interrupted receive left at `relative_path`.
    pub async fn remove_partial(
        &self,
        dst: &dyn Transport,
        relative_path: &str,
        reporter: &mut ErrorReporter,
    ) -> Result<bool> {
        info!("Removing incomplete destination subvolume {}", relative_path);
        let report = self
            .delete_subvolumes(dst, &[relative_path.to_string()], reporter)
            .await?;
        Ok(report.is_success())
    }

    async fn confirm(&self) -> Result<()> {
        if let Some(console) = self.console {
            if !self.runner.dry_run() {
                console.countdown(self.countdown_secs, self.cancel).await?;
            }
        }
        Ok(())
    }
}

fn cleanup_error(path: &str, err: &CloneError) -> CloneError {
    let mut reason = err.to_string();
    for detail in err.details() {
        reason.push_str(": ");
        reason.push_str(detail);
    }
    CloneError::Cleanup {
        path: path.to_string(),
        reason,
    }
}

/// Names of the directories directly under `root` (symlinks to directories
/// included).
pub fn scan_directories(root: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path().is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
