//! Endpoint transports.
//!
//! A [`Transport`] hides whether an endpoint is on this machine or behind
//! ssh. Components ask it for two views of the same volume: the path tools see
//! on the endpoint's own host, and a path this process can browse directly
//! (the volume itself, or an sshfs bridge for remote endpoints).

pub mod bridge;
pub mod endpoint;
pub mod local;
pub mod remote;

pub use endpoint::{Endpoint, RemoteHost};
pub use local::LocalTransport;
pub use remote::RemoteTransport;

use crate::command::ToolRunner;
use crate::utils::{CloneError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Volume root as seen by tools running on the endpoint's host
    fn tool_root(&self) -> &Path {
        &self.endpoint().path
    }

    /// Volume root as browsable from this process
    fn local_root(&self) -> &Path;

    /// Wrap a command so that it runs on the endpoint's host
    fn wrap(&self, argv: Vec<String>) -> Vec<String>;

    /// How rsync should address `path` on this endpoint: the location string
    /// and, for remote endpoints, the remote-shell option
    fn rsync_location(&self, path: &Path) -> (String, Option<String>);

    /// Release anything acquired for the run. Never fails.
    async fn teardown(&mut self);

    fn is_remote(&self) -> bool {
        self.endpoint().is_remote()
    }

    fn origin(&self) -> &str {
        &self.endpoint().origin
    }

    /// Tool-side path of a snapshot relative to the volume root
    fn tool_path(&self, relative: &str) -> PathBuf {
        self.tool_root().join(relative)
    }

    /// Locally browsable path of a snapshot relative to the volume root
    fn local_path(&self, relative: &str) -> PathBuf {
        self.local_root().join(relative)
    }
}

/// Both endpoints behind ssh is not supported: only one bridge per run.
pub fn check_endpoints(src: &Endpoint, dst: &Endpoint) -> Result<()> {
    if src.is_remote() && dst.is_remote() {
        return Err(CloneError::Config(
            "The source and destination cannot both be remote".to_string(),
        ));
    }
    if src.remote == dst.remote && src.path == dst.path {
        return Err(CloneError::Config(format!(
            "Source and destination are the same path: {}",
            src.origin
        )));
    }
    Ok(())
}

/// Turn an endpoint into a usable transport, bridging remote ones.
pub async fn resolve(
    endpoint: Endpoint,
    runner: &ToolRunner,
    side: &str,
) -> Result<Box<dyn Transport>> {
    if endpoint.is_remote() {
        Ok(Box::new(RemoteTransport::connect(endpoint, runner, side).await?))
    } else {
        Ok(Box::new(LocalTransport::new(endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_remote_is_rejected() -> Result<()> {
        let src = Endpoint::parse("ssh://a@host1/srv")?;
        let dst = Endpoint::parse("ssh://b@host2/srv")?;
        assert!(matches!(check_endpoints(&src, &dst), Err(CloneError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_identical_endpoints_are_rejected() -> Result<()> {
        let src = Endpoint::parse("/mnt/urbackup")?;
        let dst = Endpoint::parse("/mnt/urbackup/")?;
        assert!(matches!(check_endpoints(&src, &dst), Err(CloneError::Config(_))));
        Ok(())
    }

    #[test]
    fn test_one_remote_is_fine() -> Result<()> {
        let src = Endpoint::parse("/mnt/urbackup")?;
        let dst = Endpoint::parse("ssh://root@offsite/mnt/urbackup")?;
        check_endpoints(&src, &dst)
    }
}
