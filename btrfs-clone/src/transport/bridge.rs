//! Temporary sshfs mount of a remote endpoint.
//!
//! Browsing a remote volume through a local mount is far cheaper than one ssh
//! round trip per existence check. The mount lives for the whole run and is
//! released by [`BridgeMount::release`]; if that never happens (panic, early
//! return) the `Drop` impl unmounts synchronously.

use super::endpoint::RemoteHost;
use crate::command::ToolRunner;
use crate::utils::{CloneError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct BridgeMount {
    mountpoint: PathBuf,
    fusermount: String,
    mounted: bool,
}

impl BridgeMount {
    /// Mount `host:path` on a fresh directory under the system temp dir.
    pub async fn mount(
        runner: &ToolRunner,
        remote: &RemoteHost,
        path: &Path,
        side: &str,
    ) -> Result<Self> {
        let mountpoint = unique_mountpoint(side);
        tokio::fs::create_dir(&mountpoint).await.map_err(|e| {
            CloneError::Config(format!(
                "Could not create sshfs mountpoint {}: {}",
                mountpoint.display(),
                e
            ))
        })?;

        let tools = runner.tools();
        let argv = vec![
            tools.sshfs.clone(),
            "-p".to_string(),
            remote.port.to_string(),
            format!("{}:{}", remote.login(), path.display()),
            mountpoint.to_string_lossy().into_owned(),
        ];

        // sshfs must not share our session or it hangs on exit
        if let Err(e) = runner.run_detached(&argv).await {
            if let Err(rm) = tokio::fs::remove_dir(&mountpoint).await {
                warn!("Could not remove {}: {}", mountpoint.display(), rm);
            }
            return Err(e);
        }

        info!("Created sshfs mountpoint: {}", crate::command::shell_join(&argv));
        Ok(Self {
            mountpoint,
            fusermount: tools.fusermount.clone(),
            mounted: true,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount and remove the mountpoint. Failures are logged, never escalated.
    pub async fn release(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;

        info!("Unmounting sshfs tempdir {}", self.mountpoint.display());
        match tokio::process::Command::new(&self.fusermount)
            .arg("-u")
            .arg(&self.mountpoint)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(
                "Could not unmount {} ({}): {}",
                self.mountpoint.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("Could not run {}: {}", self.fusermount, e),
        }

        info!("Removing sshfs tempdir {}", self.mountpoint.display());
        if let Err(e) = tokio::fs::remove_dir(&self.mountpoint).await {
            warn!("Could not remove {}: {}", self.mountpoint.display(), e);
        }
    }
}

impl Drop for BridgeMount {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        warn!("sshfs mount {} was not released, unmounting", self.mountpoint.display());
        let _ = std::process::Command::new(&self.fusermount)
            .arg("-u")
            .arg(&self.mountpoint)
            .status();
        let _ = std::fs::remove_dir(&self.mountpoint);
    }
}

fn unique_mountpoint(side: &str) -> PathBuf {
    let stamp = chrono::Utc::now().timestamp();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("_urbcb_{}_{}_{}_", side, stamp, &tag[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mountpoints_are_unique() {
        let a = unique_mountpoint("dst");
        let b = unique_mountpoint("dst");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("_urbcb_dst_"));
        assert!(name.ends_with('_'));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mountpoint = dir.path().join("bridge");
        std::fs::create_dir(&mountpoint)?;

        let mut bridge = BridgeMount {
            mountpoint: mountpoint.clone(),
            fusermount: "true".to_string(),
            mounted: true,
        };
        bridge.release().await;
        assert!(!mountpoint.exists());

        // second call is a no-op and Drop does nothing either
        bridge.release().await;
        drop(bridge);
        Ok(())
    }
}
