//! Central failure handler.
//!
//! Every non-local failure goes through [`ErrorReporter::report`], which logs it,
//! mirrors it to stderr when stdout has been redirected elsewhere, records it for
//! the final exit status and decides whether the run may continue.

use super::errors::{CloneError, Result};
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use tracing::{error, info, warn};

pub struct ErrorReporter {
    ignore_errors: bool,
    mirror_to_stderr: bool,
    failures: Vec<String>,
    aborted: bool,
}

impl ErrorReporter {
    pub fn new(ignore_errors: bool) -> Self {
        Self {
            ignore_errors,
            mirror_to_stderr: stdout_differs_from_stderr(),
            failures: Vec::new(),
            aborted: false,
        }
    }

    /// Record a failure. Returns the error back when the run must stop.
    ///
    /// Cleanup failures never stop the run; everything else does unless
    /// errors are being ignored.
    pub fn report(&mut self, err: CloneError) -> Result<()> {
        self.record(&err);

        if err.is_cleanup() {
            return Ok(());
        }
        if self.ignore_errors {
            info!("(--ignore-errors) Continuing...");
            Ok(())
        } else {
            self.aborted = true;
            Err(err)
        }
    }

    /// Record an error that ends the run no matter what, unless
    /// [`report`](Self::report) already did so for it.
    pub fn fatal(&mut self, err: &CloneError) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if matches!(err, CloneError::Interrupted) {
            warn!("Interrupted, aborting run");
            self.failures.push(err.to_string());
            return;
        }
        self.record(err);
    }

    fn record(&mut self, err: &CloneError) {
        error!("Error: {}", err);
        for detail in err.details() {
            error!("  {}", detail);
        }

        if self.mirror_to_stderr {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{} Error: {}", stamp, err);
            for detail in err.details() {
                let _ = writeln!(stderr, "  {}", detail);
            }
        }

        self.failures.push(err.to_string());
    }

    /// A failure has stopped the run
    pub fn has_aborted(&self) -> bool {
        self.aborted
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

/// True when stdout and stderr point at different files or devices.
fn stdout_differs_from_stderr() -> bool {
    let identity = |fd: std::os::fd::BorrowedFd<'_>| {
        fd.try_clone_to_owned()
            .map(std::fs::File::from)
            .and_then(|f| f.metadata())
            .map(|m| (m.dev(), m.ino(), m.rdev()))
            .ok()
    };
    let out = identity(std::io::stdout().as_fd());
    let err = identity(std::io::stderr().as_fd());
    match (out, err) {
        (Some(out), Some(err)) => out != err,
        _ => false,
    }
}
