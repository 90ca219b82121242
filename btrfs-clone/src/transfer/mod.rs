//! Snapshot transfer pipeline.
//!
//! One transfer is `btrfs send | pv | btrfs receive`, three processes joined by
//! OS pipes. The snapshot bytes never pass through this process: we only read
//! the filter's stderr for progress text, the other stderr streams for error
//! text, and wait for the consumer to exit.

pub mod progress;

use crate::btrfs::Btrfs;
use crate::command::{shell_join, ToolRunner};
use crate::config::TransferConfig;
use crate::transport::Transport;
use crate::utils::{CloneError, Result};
use progress::{format_duration, ProgressBuffer};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Progress lines waiting for display. When full, new lines are dropped
/// rather than blocking the reader (and with it the filter).
const PROGRESS_CHANNEL_DEPTH: usize = 16;

/// The argv of each pipeline stage
#[derive(Debug, Clone)]
pub struct PipelineCommands {
    pub producer: Vec<String>,
    pub filter: Option<Vec<String>>,
    pub consumer: Vec<String>,
}

impl PipelineCommands {
    /// Stands in for a real transfer in dry-run mode.
    pub fn noop() -> Self {
        Self {
            producer: vec!["true".to_string()],
            filter: None,
            consumer: vec!["true".to_string()],
        }
    }

    pub fn describe(&self) -> String {
        let mut stages = vec![shell_join(&self.producer)];
        if let Some(filter) = &self.filter {
            stages.push(shell_join(filter));
        }
        stages.push(shell_join(&self.consumer));
        stages.join(" | ")
    }
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Last complete line the progress filter printed
    pub last_progress: Option<String>,
    pub elapsed: Duration,
}

pub struct TransferPipeline<'a> {
    runner: &'a ToolRunner,
    btrfs: &'a Btrfs,
    filter: Option<Vec<String>>,
    poll_interval: Duration,
    interactive: bool,
    cancel: CancellationToken,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(
        runner: &'a ToolRunner,
        btrfs: &'a Btrfs,
        config: &TransferConfig,
        interactive: bool,
        cancel: CancellationToken,
    ) -> Self {
        let filter = (!config.progress_filter.is_empty()).then(|| config.progress_filter.clone());
        Self {
            runner,
            btrfs,
            filter,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            interactive,
            cancel,
        }
    }

    /// Replicate the snapshot at `relative_path` from `src` to the same
    /// relative path on `dst`, incrementally from `parent` when given.
    pub async fn transfer(
        &self,
        src: &dyn Transport,
        dst: &dyn Transport,
        relative_path: &str,
        parent: Option<&str>,
    ) -> Result<TransferOutcome> {
        let target_dir = Path::new(relative_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let local_dir = dst.local_path(&target_dir);
        if !tokio::fs::try_exists(&local_dir).await.unwrap_or(false) {
            if self.runner.dry_run() {
                info!("(--dry-run) NOT creating directory {}", local_dir.display());
            } else {
                info!("Creating directory {}", local_dir.display());
                tokio::fs::create_dir_all(&local_dir).await?;
            }
        }

        let producer = self.btrfs.send(
            &src.tool_path(relative_path),
            parent.map(|p| src.tool_path(p)).as_deref(),
        );
        let consumer = self.btrfs.receive(&dst.tool_path(&target_dir));
        let commands = PipelineCommands {
            producer: src.wrap(producer),
            filter: self.filter.clone(),
            consumer: dst.wrap(consumer),
        };

        if self.runner.dry_run() {
            info!("(--dry-run) NOT running: {}", commands.describe());
            return self.run(&PipelineCommands::noop(), relative_path).await;
        }

        info!("Running: {}", commands.describe());
        self.run(&commands, relative_path).await
    }

    /// Spawn the stages, follow progress until the consumer exits and judge
    /// the result by the consumer's status and all captured error text.
    pub async fn run(&self, commands: &PipelineCommands, label: &str) -> Result<TransferOutcome> {
        let started = Instant::now();

        let mut producer = self.spawn(&commands.producer, Stdio::null(), Stdio::piped())?;
        let producer_errors = producer.stderr.take().map(collect_stderr);
        let producer_out: Stdio = take_stdout(&mut producer, &commands.producer)?;

        let (consumer_in, mut filter, progress_stream) = match &commands.filter {
            Some(argv) => {
                let mut filter = self.spawn(argv, producer_out, Stdio::piped())?;
                let progress = filter.stderr.take();
                let filtered = take_stdout(&mut filter, argv)?;
                (filtered, Some(filter), progress)
            }
            None => (producer_out, None, None),
        };

        let mut consumer = self.spawn(&commands.consumer, consumer_in, Stdio::null())?;
        let consumer_errors = consumer.stderr.take().map(collect_stderr);

        let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_DEPTH);
        let reader = progress_stream.map(|stderr| tokio::spawn(read_progress(stderr, tx)));

        let mut last_progress = None;
        let mut last_shown: Option<Instant> = None;
        let status = loop {
            tokio::select! {
                status = consumer.wait() => break status?,
                Some(line) = rx.recv() => {
                    self.show(&line, &mut last_shown);
                    last_progress = Some(line);
                }
                _ = self.cancel.cancelled() => {
                    debug!("Interrupted, killing transfer of {}", label);
                    let _ = consumer.kill().await;
                    if let Some(filter) = filter.as_mut() {
                        let _ = filter.kill().await;
                    }
                    let _ = producer.kill().await;
                    return Err(CloneError::Interrupted);
                }
            }
        };

        // drain what arrived after the consumer exited
        while let Ok(line) = rx.try_recv() {
            last_progress = Some(line);
        }
        if let Some(reader) = reader {
            if let Ok(Some(tail)) = reader.await {
                last_progress = Some(tail);
            }
        }
        if let Some(filter) = filter.as_mut() {
            let _ = filter.wait().await;
        }
        let _ = producer.wait().await;

        if self.interactive && last_shown.is_some() {
            eprintln!();
        }

        let mut errors = Vec::new();
        for task in [producer_errors, consumer_errors].into_iter().flatten() {
            let text = task.await.unwrap_or_default();
            let text = text.trim();
            if !text.is_empty() {
                errors.push(text.to_string());
            }
        }

        if !status.success() || !errors.is_empty() {
            let mut reason = format!("receive exited with {}", status);
            if !errors.is_empty() {
                reason = format!("{}: {}", reason, errors.join("; "));
            }
            return Err(CloneError::Transfer {
                path: label.to_string(),
                reason,
            });
        }

        let elapsed = started.elapsed();
        match &last_progress {
            Some(line) => info!("Transferred {} in {}: {}", label, format_duration(elapsed), line),
            None => info!("Transferred {} in {}", label, format_duration(elapsed)),
        }
        Ok(TransferOutcome { last_progress, elapsed })
    }

    fn spawn(&self, argv: &[String], stdin: Stdio, stdout: Stdio) -> Result<Child> {
        let mut cmd = self.runner.command(argv)?;
        cmd.stdin(stdin).stdout(stdout).stderr(Stdio::piped());
        cmd.spawn().map_err(|e| CloneError::ToolInvocation {
            command: shell_join(argv),
            status: "failed to start".to_string(),
            stdout: String::new(),
            stderr: e.to_string(),
        })
    }

    /// Redraw the progress line in place, at most once per poll interval.
    fn show(&self, line: &str, last_shown: &mut Option<Instant>) {
        trace!("progress: {}", line);
        if !self.interactive {
            return;
        }
        if last_shown.is_some_and(|t| t.elapsed() < self.poll_interval) {
            return;
        }
        *last_shown = Some(Instant::now());
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{}\x1b[K", line);
        let _ = stderr.flush();
    }
}

fn take_stdout(child: &mut Child, argv: &[String]) -> Result<Stdio> {
    let stdout = child.stdout.take().ok_or_else(|| CloneError::ToolInvocation {
        command: shell_join(argv),
        status: "no stdout pipe".to_string(),
        stdout: String::new(),
        stderr: String::new(),
    })?;
    Ok(stdout.try_into()?)
}

/// Read a stderr stream to the end in the background so the child never
/// blocks on a full pipe.
fn collect_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut buf).await {
            debug!("Reading stderr failed: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Turn the filter's stderr into complete progress lines. Returns the
/// unterminated tail left when the stream closes.
async fn read_progress(mut stderr: ChildStderr, tx: mpsc::Sender<String>) -> Option<String> {
    let mut buffer = ProgressBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(line) = buffer.push(&chunk[..n]) {
                    let _ = tx.try_send(line);
                }
            }
            Err(e) => {
                debug!("Reading progress failed: {}", e);
                break;
            }
        }
    }
    buffer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_describe() {
        let commands = PipelineCommands {
            producer: argv(&["btrfs", "-q", "send", "/mnt/src/h/1"]),
            filter: Some(argv(&["pv", "-f", "-F", "size [%b]"])),
            consumer: argv(&["btrfs", "-q", "receive", "/mnt/dst/h"]),
        };
        assert_eq!(
            commands.describe(),
            "btrfs -q send /mnt/src/h/1 | pv -f -F 'size [%b]' | btrfs -q receive /mnt/dst/h"
        );
    }

    #[test]
    fn test_empty_filter_config_disables_filter() {
        let runner = ToolRunner::new(&Default::default(), false);
        let btrfs = Btrfs::new("btrfs");
        let config = TransferConfig {
            progress_filter: Vec::new(),
            poll_interval_ms: 10,
        };
        let pipeline = TransferPipeline::new(&runner, &btrfs, &config, false, CancellationToken::new());
        assert!(pipeline.filter.is_none());
    }

    #[tokio::test]
    async fn test_noop_pipeline_succeeds() -> Result<()> {
        let runner = ToolRunner::new(&Default::default(), false);
        let btrfs = Btrfs::new("btrfs");
        let pipeline = TransferPipeline::new(
            &runner,
            &btrfs,
            &TransferConfig::default(),
            false,
            CancellationToken::new(),
        );
        let outcome = pipeline.run(&PipelineCommands::noop(), "noop").await?;
        assert!(outcome.last_progress.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_kills_pipeline() {
        let runner = ToolRunner::new(&Default::default(), false);
        let btrfs = Btrfs::new("btrfs");
        let cancel = CancellationToken::new();
        let pipeline = TransferPipeline::new(&runner, &btrfs, &TransferConfig::default(), false, cancel.clone());
        let commands = PipelineCommands {
            producer: argv(&["sleep", "30"]),
            filter: None,
            consumer: argv(&["sh", "-c", "cat >/dev/null"]),
        };
        cancel.cancel();
        let err = pipeline.run(&commands, "slow").await.unwrap_err();
        assert!(matches!(err, CloneError::Interrupted));
    }
}
