//! External tool invocation.
//!
//! Every command outside the transfer pipeline goes through [`ToolRunner`]:
//! it extends PATH, wraps the command for the endpoint's host, honours dry-run
//! for mutating calls and turns a non-zero exit into a
//! [`CloneError::ToolInvocation`] carrying the captured output.

use crate::config::ToolsConfig;
use crate::transport::Transport;
use crate::utils::{CloneError, Result};
use std::borrow::Cow;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

pub struct ToolRunner {
    tools: ToolsConfig,
    search_path: String,
    dry_run: bool,
}

impl ToolRunner {
    pub fn new(tools: &ToolsConfig, dry_run: bool) -> Self {
        Self {
            search_path: tools.search_path(),
            tools: tools.clone(),
            dry_run,
        }
    }

    pub fn tools(&self) -> &ToolsConfig {
        &self.tools
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Build a process for `argv` with the extended PATH. Children are killed
    /// if their handle is dropped, so an aborted run leaves nothing behind.
    pub fn command(&self, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CloneError::Config("Empty command line".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("PATH", &self.search_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run a local command to completion; non-zero exit is an error.
    pub async fn output(&self, argv: &[String]) -> Result<CommandOutput> {
        let cmd = self.command(argv)?;
        self.finish(argv, cmd).await
    }

    /// Run a command on the endpoint's host. Read-only, so dry-run does not apply.
    pub async fn query(&self, transport: &dyn Transport, argv: Vec<String>) -> Result<CommandOutput> {
        let argv = transport.wrap(argv);
        debug!("Running: {}", shell_join(&argv));
        self.output(&argv).await
    }

    /// Run a command that changes an endpoint. In dry-run mode it is only
    /// logged; the return value says whether it actually ran.
    pub async fn mutate(&self, transport: Option<&dyn Transport>, argv: Vec<String>) -> Result<bool> {
        if self.dry_run {
            info!("(--dry-run) NOT running: {}", shell_join(&argv));
            return Ok(false);
        }
        let argv = match transport {
            Some(t) => t.wrap(argv),
            None => argv,
        };
        debug!("Running: {}", shell_join(&argv));
        self.output(&argv).await?;
        Ok(true)
    }

    /// Run a local command in its own process group (used for sshfs, which
    /// daemonizes and must not receive our terminal's signals).
    pub async fn run_detached(&self, argv: &[String]) -> Result<CommandOutput> {
        let mut cmd = self.command(argv)?;
        cmd.process_group(0);
        self.finish(argv, cmd).await
    }

    async fn finish(&self, argv: &[String], mut cmd: Command) -> Result<CommandOutput> {
        let out = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CloneError::ToolInvocation {
                command: shell_join(argv),
                status: "failed to start".to_string(),
                stdout: String::new(),
                stderr: e.to_string(),
            })?;

        let output = CommandOutput {
            status: out.status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(CloneError::ToolInvocation {
                command: shell_join(argv),
                status: output.status.to_string(),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\"'\"'")))
    }
}

/// Join an argv into one shell-safe command line.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
