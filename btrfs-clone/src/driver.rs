//! One replication run from start to finish.
//!
//! The driver resolves both endpoints, builds inventories, optionally removes
//! strays, then sends pending snapshots one at a time in id order. Whatever
//! happens, bridge mounts acquired while resolving are released before
//! [`Driver::run`] returns.

use crate::btrfs::{self, Btrfs, SubvolumeProbe};
use crate::cleaner::{self, StrayCleaner};
use crate::command::ToolRunner;
use crate::config::{Config, RunOptions};
use crate::inventory::{Inventory, InventoryBuilder};
use crate::misc_sync::MiscSync;
use crate::prompt::Console;
use crate::reconcile::{self, Reconciliation};
use crate::stats;
use crate::transfer::TransferPipeline;
use crate::transport::{self, Endpoint, Transport};
use crate::utils::{CloneError, ErrorReporter, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Counters for the final report
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Source snapshots that already had a destination copy
    pub matched: usize,
    pub attempted: usize,
    /// Sends that completed; under `--dry-run`, sends that would have run
    pub transferred: usize,
    pub failed: usize,
    /// Pending snapshots that vanished from the source before their turn
    pub skipped: usize,
    pub strays_deleted: usize,
    pub cleanup_failures: usize,
    pub failures: Vec<String>,
    /// Nothing was actually sent or deleted
    pub dry_run: bool,
}

impl RunSummary {
    /// Nothing went wrong, cleanup included
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line outcome for the end of the run.
    pub fn headline(&self) -> String {
        if self.dry_run {
            format!(
                "Dry run done: {} would be transferred, {} skipped, {} already present",
                self.transferred, self.skipped, self.matched
            )
        } else {
            format!(
                "Done: {} transferred, {} failed, {} skipped, {} already present",
                self.transferred, self.failed, self.skipped, self.matched
            )
        }
    }

    fn log(&self) {
        info!("{}", self.headline());
        if self.strays_deleted > 0 || self.cleanup_failures > 0 {
            info!(
                "Strays: {} deleted, {} could not be deleted",
                self.strays_deleted, self.cleanup_failures
            );
        }
        if !self.failures.is_empty() {
            warn!("Finished with {} error(s):", self.failures.len());
            for failure in &self.failures {
                warn!("  {}", failure);
            }
        }
    }
}

pub struct Driver<'a> {
    config: &'a Config,
    options: &'a RunOptions,
    runner: ToolRunner,
    btrfs: Btrfs,
    cancel: CancellationToken,
}

impl<'a> Driver<'a> {
    pub fn new(config: &'a Config, options: &'a RunOptions, cancel: CancellationToken) -> Self {
        Self {
            config,
            options,
            runner: ToolRunner::new(&config.tools, options.dry_run),
            btrfs: Btrfs::new(&config.tools.btrfs),
            cancel,
        }
    }

    /// Replicate `src` to `dst`.
    ///
    /// Returns the summary when the run got to the end, even if some items
    /// failed along the way; an `Err` means the run was aborted.
    pub async fn run(&self, src: Endpoint, dst: Endpoint) -> Result<RunSummary> {
        let mut reporter = ErrorReporter::new(self.options.ignore_errors);
        let mut summary = RunSummary {
            dry_run: self.options.dry_run,
            ..RunSummary::default()
        };

        info!("Copying UrBackup BTRFS snapshots from {} to {}", src, dst);
        if self.options.dry_run {
            info!("(--dry-run) No changes will be made");
        }

        if let Err(e) = transport::check_endpoints(&src, &dst) {
            reporter.fatal(&e);
            return Err(e);
        }

        let mut src = match transport::resolve(src, &self.runner, "src").await {
            Ok(t) => t,
            Err(e) => {
                reporter.fatal(&e);
                return Err(e);
            }
        };
        let mut dst = match transport::resolve(dst, &self.runner, "dst").await {
            Ok(t) => t,
            Err(e) => {
                src.teardown().await;
                reporter.fatal(&e);
                return Err(e);
            }
        };

        let console = self.options.interactive.then(Console::stdin);
        let result = self
            .execute(&*src, &*dst, console.as_ref(), &mut reporter, &mut summary)
            .await;

        dst.teardown().await;
        src.teardown().await;

        match result {
            Ok(()) => {
                summary.failures = reporter.failures().to_vec();
                summary.log();
                Ok(summary)
            }
            Err(e) => {
                reporter.fatal(&e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        src: &dyn Transport,
        dst: &dyn Transport,
        console: Option<&Console>,
        reporter: &mut ErrorReporter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        self.check_cancelled()?;
        self.check_filesystems(src, dst).await?;

        debug!("Building subvolume list for {}", src.origin());
        let src_inventory = self.list(src, true, reporter).await?;
        debug!("Building subvolume list for {}", dst.origin());
        let mut dst_inventory = self.list(dst, false, reporter).await?;

        self.show_stats(src, &src_inventory, dst, &dst_inventory, reporter)
            .await?;

        if let Some(console) = console {
            console
                .countdown(self.config.cleanup.start_countdown_secs, &self.cancel)
                .await?;
        }

        dump("source", &src_inventory);
        dump("destination", &dst_inventory);

        self.check_cancelled()?;
        MiscSync::new(&self.runner, &self.config.misc)
            .sync(src, dst, reporter)
            .await?;

        let cleaner = StrayCleaner::new(
            &self.runner,
            &self.btrfs,
            self.config.cleanup.countdown_secs,
            console,
            &self.cancel,
        );

        // strays never share a path with a source record, so deleting them
        // leaves pending and matched as they are
        let mut reconciliation = reconcile::reconcile(&src_inventory, &dst_inventory);

        self.check_cancelled()?;
        if self.options.delete_strays {
            self.add_stray_directories(src, dst, &dst_inventory, &mut reconciliation, reporter)?;
            let strays = &reconciliation.strays;
            if strays.is_empty() {
                debug!("No stray destination subvolumes or directories");
            } else {
                let report = cleaner.clean(dst, strays, reporter).await?;
                summary.strays_deleted += report.deleted;
                summary.cleanup_failures += report.failed;
                if report.deleted > 0 {
                    self.refresh(dst, &mut dst_inventory, reporter).await?;
                }
            }
        } else if !reconciliation.strays.subvolumes.is_empty() {
            info!(
                "{} stray destination subvolume(s) left in place (see --delete-strays)",
                reconciliation.strays.subvolumes.len()
            );
        }

        for conflict in std::mem::take(&mut reconciliation.conflicts) {
            reporter.report(conflict)?;
        }
        summary.matched = reconciliation.matched.len();
        for pair in &reconciliation.matched {
            trace!(
                "Valid destination {} (src id {}, dst id {})",
                pair.source.relative_path,
                pair.source.id,
                pair.destination.id
            );
        }
        info!(
            "{} of {} source subvolume(s) to transfer",
            reconciliation.pending.len(),
            src_inventory.len()
        );

        let pipeline = TransferPipeline::new(
            &self.runner,
            &self.btrfs,
            &self.config.transfer,
            self.options.interactive,
            self.cancel.clone(),
        );
        let probe = SubvolumeProbe::new(&self.runner, &self.btrfs, src);
        let refresh_interval = self.config.stats.refresh_interval;

        for pending in &reconciliation.pending {
            self.check_cancelled()?;
            let path = pending.relative_path.as_str();

            if !exists(&src.local_path(path)).await {
                info!(path = %path, "Skipping, subvolume no longer available at the source");
                summary.skipped += 1;
                continue;
            }

            if exists(&dst.local_path(path)).await {
                // left behind by an interrupted receive
                if !cleaner.remove_partial(dst, path, reporter).await? {
                    summary.cleanup_failures += 1;
                }
            }

            let parent = reconcile::select_parent(pending, &src_inventory, &probe).await;
            match parent {
                Some(parent) => info!("Sending {} incrementally from {}", path, parent.relative_path),
                None => info!("Sending {} in full", path),
            }

            summary.attempted += 1;
            let parent_path = parent.map(|p| p.relative_path.as_str());
            match pipeline.transfer(src, dst, path, parent_path).await {
                Ok(_) => summary.transferred += 1,
                Err(CloneError::Interrupted) => return Err(CloneError::Interrupted),
                Err(e) => {
                    summary.failed += 1;
                    reporter.report(e)?;
                    continue;
                }
            }

            if refresh_interval > 0 && summary.transferred % refresh_interval == 0 {
                if !self.options.dry_run {
                    self.refresh(dst, &mut dst_inventory, reporter).await?;
                }
                self.show_stats(src, &src_inventory, dst, &dst_inventory, reporter)
                    .await?;
            }
        }

        if summary.transferred > 0 && !self.options.dry_run {
            self.refresh(dst, &mut dst_inventory, reporter).await?;
        }
        self.show_stats(src, &src_inventory, dst, &dst_inventory, reporter)
            .await?;
        Ok(())
    }

    /// Both endpoints must be btrfs, and not the same filesystem.
    async fn check_filesystems(&self, src: &dyn Transport, dst: &dyn Transport) -> Result<()> {
        let src_uuid = btrfs::filesystem_uuid(&self.runner, &self.btrfs, src).await?;
        let dst_uuid = btrfs::filesystem_uuid(&self.runner, &self.btrfs, dst).await?;
        debug!("     Source BTRFS uuid {} path {}", src_uuid, src.origin());
        debug!("Destination BTRFS uuid {} path {}", dst_uuid, dst.origin());

        if src_uuid == dst_uuid {
            return Err(CloneError::Config(format!(
                "{} and {} are the same file system",
                src.origin(),
                dst.origin()
            )));
        }
        Ok(())
    }

    /// Fresh inventory of `transport`. Unreadable lines go through the reporter;
    /// with errors ignored the inventory is used without them.
    async fn list(
        &self,
        transport: &dyn Transport,
        read_only: bool,
        reporter: &mut ErrorReporter,
    ) -> Result<Inventory> {
        let listing = InventoryBuilder::new(&self.runner, &self.btrfs)
            .build(transport, read_only)
            .await?;
        for rejected in listing.rejected {
            reporter.report(rejected)?;
        }
        Ok(listing.inventory)
    }

    /// Re-list the destination. When the listing fails and errors are ignored,
    /// `inventory` keeps its last good contents.
    async fn refresh(
        &self,
        dst: &dyn Transport,
        inventory: &mut Inventory,
        reporter: &mut ErrorReporter,
    ) -> Result<()> {
        match self.list(dst, false, reporter).await {
            Ok(fresh) => *inventory = fresh,
            // a rejected line already went through the reporter
            Err(e) if reporter.has_aborted() => return Err(e),
            Err(e) => {
                reporter.report(e)?;
                warn!("Destination stats are stale, keeping the previous subvolume list");
            }
        }
        Ok(())
    }

    /// Scan the top-level directories of both volumes for strays. A failed
    /// scan leaves only the stray subvolumes to delete.
    fn add_stray_directories(
        &self,
        src: &dyn Transport,
        dst: &dyn Transport,
        dst_inventory: &Inventory,
        reconciliation: &mut Reconciliation,
        reporter: &mut ErrorReporter,
    ) -> Result<()> {
        let scanned = cleaner::scan_directories(src.local_root())
            .and_then(|s| Ok((s, cleaner::scan_directories(dst.local_root())?)));
        match scanned {
            Ok((src_dirs, dst_dirs)) => {
                let excluded = self.config.misc.destination_dir_name();
                reconciliation.add_stray_directories(&src_dirs, &dst_dirs, dst_inventory, excluded.as_deref());
            }
            Err(e) => reporter.report(e)?,
        }
        Ok(())
    }

    async fn show_stats(
        &self,
        src: &dyn Transport,
        src_inventory: &Inventory,
        dst: &dyn Transport,
        dst_inventory: &Inventory,
        reporter: &mut ErrorReporter,
    ) -> Result<()> {
        let src_used = usage(src, reporter).await?;
        let dst_used = usage(dst, reporter).await?;
        stats::show(
            &stats::summarize(src_inventory, src_used),
            src.origin(),
            &stats::summarize(dst_inventory, dst_used),
            dst.origin(),
        );
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CloneError::Interrupted);
        }
        Ok(())
    }
}

async fn usage(transport: &dyn Transport, reporter: &mut ErrorReporter) -> Result<u64> {
    match stats::percent_used(transport.local_root()).await {
        Ok(percent) => Ok(percent),
        Err(e) => {
            reporter.report(e)?;
            Ok(0)
        }
    }
}

async fn exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn dump(side: &str, inventory: &Inventory) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    match serde_json::to_string_pretty(inventory) {
        Ok(json) => trace!("{} subvolumes: {}", side, json),
        Err(e) => debug!("Could not dump {} subvolumes: {}", side, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_success_follows_failures() {
        let mut summary = RunSummary::default();
        assert!(summary.is_success());
        summary.failures.push("Cleanup of old failed: busy".to_string());
        assert!(!summary.is_success());
    }

    #[test]
    fn test_dry_run_headline_does_not_claim_transfers() {
        let mut summary = RunSummary {
            transferred: 3,
            matched: 2,
            ..RunSummary::default()
        };
        assert_eq!(summary.headline(), "Done: 3 transferred, 0 failed, 0 skipped, 2 already present");

        summary.dry_run = true;
        assert!(summary.headline().starts_with("Dry run done: 3 would be transferred"));
        assert!(!summary.headline().contains("failed"));
    }

    #[tokio::test]
    async fn test_both_remote_aborts_before_anything_runs() -> Result<()> {
        let config = Config::default();
        let options = RunOptions::default();
        let driver = Driver::new(&config, &options, CancellationToken::new());

        let err = driver
            .run(Endpoint::parse("ssh://a@one/srv")?, Endpoint::parse("ssh://b@two/srv")?)
            .await
            .unwrap_err();
        assert!(matches!(err, CloneError::Config(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        let config = Config::default();
        let options = RunOptions::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let driver = Driver::new(&config, &options, cancel);

        let result = driver
            .run(
                Endpoint::parse(&src.path().to_string_lossy())?,
                Endpoint::parse(&dst.path().to_string_lossy())?,
            )
            .await;
        assert!(matches!(result, Err(CloneError::Interrupted)));
        Ok(())
    }
}
