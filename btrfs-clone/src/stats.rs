//! Subvolume and capacity statistics for both endpoints.

use crate::inventory::Inventory;
use crate::utils::Result;
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    pub count: usize,
    pub parent_count: usize,
    pub orphan_count: usize,
    pub percent_used: u64,
}

impl EndpointStats {
    fn columns(&self) -> [String; 4] {
        [
            self.count.to_string(),
            self.parent_count.to_string(),
            self.orphan_count.to_string(),
            self.percent_used.to_string(),
        ]
    }
}

pub fn summarize(inventory: &Inventory, percent_used: u64) -> EndpointStats {
    EndpointStats {
        count: inventory.len(),
        parent_count: inventory.parent_count(),
        orphan_count: inventory.orphans().len(),
        percent_used,
    }
}

#[derive(Debug, Clone, Copy)]
struct DiskUsage {
    used: u64,
    available: u64,
}

impl DiskUsage {
    /// Share of the space usable by unprivileged writers that is taken,
    /// rounded to whole percent.
    fn used_percent(&self) -> u64 {
        let usable = self.used + self.available;
        if usable > 0 {
            (self.used * 100 + usable / 2) / usable
        } else {
            0
        }
    }
}

/// Capacity utilization of the filesystem holding `path`.
pub async fn percent_used(path: &Path) -> Result<u64> {
    let path: PathBuf = path.to_path_buf();
    let usage = tokio::task::spawn_blocking(move || -> Result<DiskUsage> {
        let vfs = statvfs(&path).map_err(std::io::Error::from)?;
        let block = vfs.fragment_size() as u64;
        Ok(DiskUsage {
            used: (vfs.blocks() as u64).saturating_sub(vfs.blocks_free() as u64) * block,
            available: vfs.blocks_available() as u64 * block,
        })
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(usage.used_percent())
}

/// Two lines, numbers right-aligned to one width shared by every column.
pub fn render(src: &EndpointStats, src_origin: &str, dst: &EndpointStats, dst_origin: &str) -> [String; 2] {
    let (src_cols, dst_cols) = (src.columns(), dst.columns());
    let width = src_cols
        .iter()
        .chain(dst_cols.iter())
        .map(String::len)
        .max()
        .unwrap_or(1);

    let line = |label: &str, cols: &[String; 4], origin: &str| {
        format!(
            "{:>12} ({:>w$} subvols, {:>w$} parents, {:>w$} orphans, {:>w$}% full): {}",
            label,
            cols[0],
            cols[1],
            cols[2],
            cols[3],
            origin,
            w = width
        )
    };
    [
        line("Source", &src_cols, src_origin),
        line("Destination", &dst_cols, dst_origin),
    ]
}

/// Log both endpoints' stats.
pub fn show(src: &EndpointStats, src_origin: &str, dst: &EndpointStats, dst_origin: &str) {
    for line in render(src, src_origin, dst, dst_origin) {
        info!("{}", line);
    }
}
