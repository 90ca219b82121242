//! Transport for a volume reached over ssh.
//!
//! Commands are wrapped in an `ssh -p PORT user@host '<command>'` invocation,
//! and the volume is browsed through an sshfs [`BridgeMount`].

use super::bridge::BridgeMount;
use super::{Endpoint, RemoteHost, Transport};
use crate::command::{shell_join, ToolRunner};
use crate::utils::Result;
use async_trait::async_trait;
use std::path::Path;

pub struct RemoteTransport {
    endpoint: Endpoint,
    remote: RemoteHost,
    ssh: String,
    bridge: BridgeMount,
}

impl RemoteTransport {
    /// Bridge the remote volume locally for the duration of the run.
    pub async fn connect(endpoint: Endpoint, runner: &ToolRunner, side: &str) -> Result<Self> {
        let remote = endpoint.remote.clone().ok_or_else(|| {
            crate::CloneError::Config(format!("{} is not a remote endpoint", endpoint.origin))
        })?;
        let bridge = BridgeMount::mount(runner, &remote, &endpoint.path, side).await?;
        Ok(Self {
            ssh: runner.tools().ssh.clone(),
            endpoint,
            remote,
            bridge,
        })
    }
}

/// `ssh -p PORT user@host 'cmd args...'`
pub fn ssh_wrap(ssh: &str, remote: &RemoteHost, argv: &[String]) -> Vec<String> {
    vec![
        ssh.to_string(),
        "-p".to_string(),
        remote.port.to_string(),
        remote.login(),
        shell_join(argv),
    ]
}

#[async_trait]
impl Transport for RemoteTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn local_root(&self) -> &Path {
        self.bridge.mountpoint()
    }

    fn wrap(&self, argv: Vec<String>) -> Vec<String> {
        ssh_wrap(&self.ssh, &self.remote, &argv)
    }

    fn rsync_location(&self, path: &Path) -> (String, Option<String>) {
        (
            format!("{}:{}", self.remote.login(), path.display()),
            Some(format!("{} -p {}", self.ssh, self.remote.port)),
        )
    }

    async fn teardown(&mut self) {
        self.bridge.release().await;
    }
}
