//! Copies of non-snapshot files (server database, client symlinks) made with
//! rsync next to the replicated snapshots.

use crate::command::ToolRunner;
use crate::config::MiscConfig;
use crate::transport::endpoint::normalize;
use crate::transport::Transport;
use crate::utils::{ErrorReporter, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct MiscSync<'a> {
    runner: &'a ToolRunner,
    misc: &'a MiscConfig,
}

impl<'a> MiscSync<'a> {
    pub fn new(runner: &'a ToolRunner, misc: &'a MiscConfig) -> Self {
        Self { runner, misc }
    }

    /// Copy every configured source. Returns how many copies succeeded;
    /// failures go through `reporter`.
    pub async fn sync(
        &self,
        src: &dyn Transport,
        dst: &dyn Transport,
        reporter: &mut ErrorReporter,
    ) -> Result<usize> {
        if self.misc.sources.is_empty() {
            debug!("No miscellaneous sources configured");
            return Ok(0);
        }
        info!("Using rsync to back up databases and client symlinks");

        let destination = expand(&self.misc.destination, "{dst}", dst.tool_root());
        let mut copied = 0;
        for template in &self.misc.sources {
            let source = expand(template, "{src}", src.tool_root());
            let argv = rsync_argv(&self.runner.tools().rsync, src, &source, dst, &destination);
            match self.runner.mutate(None, argv).await {
                Ok(true) => {
                    debug!("Copied {} to {}", source.display(), destination.display());
                    copied += 1;
                }
                Ok(false) => {}
                Err(e) => reporter.report(e)?,
            }
        }
        Ok(copied)
    }
}

fn expand(template: &str, placeholder: &str, root: &Path) -> PathBuf {
    normalize(Path::new(&template.replace(placeholder, &root.to_string_lossy())))
}

/// `rsync -a --mkpath --delete --relative [-e SSH] SRC DST`
pub fn rsync_argv(
    rsync: &str,
    src: &dyn Transport,
    source: &Path,
    dst: &dyn Transport,
    destination: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = [rsync, "-a", "--mkpath", "--delete", "--relative"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let (from, src_shell) = src.rsync_location(source);
    let (to, dst_shell) = dst.rsync_location(destination);
    if let Some(shell) = src_shell.or(dst_shell) {
        argv.push("-e".to_string());
        argv.push(shell);
    }
    argv.push(from);
    argv.push(to);
    argv
}
