//! btrfs command lines and output parsing.

use crate::command::ToolRunner;
use crate::reconcile::SnapshotProbe;
use crate::transport::Transport;
use crate::utils::{CloneError, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Builds btrfs argv vectors for the configured binary.
#[derive(Debug, Clone)]
pub struct Btrfs {
    bin: String,
}

impl Btrfs {
    pub fn new(bin: &str) -> Self {
        Self { bin: bin.to_string() }
    }

    fn argv(&self, args: &[&str], path: &Path) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(self.bin.clone());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv.push(path.to_string_lossy().into_owned());
        argv
    }

    /// `btrfs subvolume list -qRu[r] ROOT`
    pub fn list(&self, root: &Path, read_only: bool) -> Vec<String> {
        let flags = if read_only { "-qRur" } else { "-qRu" };
        self.argv(&["subvolume", "list", flags], root)
    }

    /// `btrfs -q send [-p PARENT] PATH`
    pub fn send(&self, path: &Path, parent: Option<&Path>) -> Vec<String> {
        let mut argv = vec![self.bin.clone(), "-q".to_string(), "send".to_string()];
        if let Some(parent) = parent {
            argv.push("-p".to_string());
            argv.push(parent.to_string_lossy().into_owned());
        }
        argv.push(path.to_string_lossy().into_owned());
        argv
    }

    /// `btrfs -q receive DIR`
    pub fn receive(&self, dir: &Path) -> Vec<String> {
        self.argv(&["-q", "receive"], dir)
    }

    /// `btrfs property get -ts PATH ro`
    pub fn read_only_property(&self, path: &Path) -> Vec<String> {
        let mut argv = self.argv(&["property", "get", "-ts"], path);
        argv.push("ro".to_string());
        argv
    }

    /// `btrfs subvolume delete PATH`
    pub fn delete(&self, path: &Path) -> Vec<String> {
        self.argv(&["subvolume", "delete"], path)
    }

    /// `btrfs filesystem show PATH`
    pub fn filesystem_show(&self, path: &Path) -> Vec<String> {
        self.argv(&["filesystem", "show"], path)
    }
}

/// First `uuid: <hex-and-dashes>` in `btrfs filesystem show` output.
pub fn parse_filesystem_uuid(output: &str) -> Option<String> {
    output.match_indices("uuid: ").find_map(|(idx, label)| {
        let uuid: String = output[idx + label.len()..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
            .collect();
        (!uuid.is_empty()).then_some(uuid)
    })
}

/// `ro=true` anywhere in `btrfs property get` output, case-insensitive.
pub fn parse_read_only(output: &str) -> bool {
    output.to_ascii_lowercase().contains("ro=true")
}

/// Storage identity of the volume behind `transport`.
pub async fn filesystem_uuid(
    runner: &ToolRunner,
    btrfs: &Btrfs,
    transport: &dyn Transport,
) -> Result<String> {
    let out = runner
        .query(transport, btrfs.filesystem_show(transport.tool_root()))
        .await?;
    parse_filesystem_uuid(&out.stdout).ok_or_else(|| {
        CloneError::Config(format!(
            "Could not find BTRFS filesystem uuid for {:?}",
            transport.origin()
        ))
    })
}

/// Answers parent-validity questions against the live source volume.
pub struct SubvolumeProbe<'a> {
    runner: &'a ToolRunner,
    btrfs: &'a Btrfs,
    transport: &'a dyn Transport,
}

impl<'a> SubvolumeProbe<'a> {
    pub fn new(runner: &'a ToolRunner, btrfs: &'a Btrfs, transport: &'a dyn Transport) -> Self {
        Self { runner, btrfs, transport }
    }
}

#[async_trait]
impl<'a> SnapshotProbe for SubvolumeProbe<'a> {
    async fn exists(&self, relative_path: &str) -> bool {
        tokio::fs::try_exists(self.transport.local_path(relative_path))
            .await
            .unwrap_or(false)
    }

    async fn is_read_only(&self, relative_path: &str) -> bool {
        let argv = self
            .btrfs
            .read_only_property(&self.transport.tool_path(relative_path));
        match self.runner.query(self.transport, argv).await {
            Ok(out) => parse_read_only(&out.stdout),
            Err(e) => {
                debug!("Read-only check for {} failed: {}", relative_path, e);
                false
            }
        }
    }
}
