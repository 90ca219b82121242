//! Snapshot inventories.
//!
//! An [`Inventory`] is an immutable, id-ordered list of the subvolumes one
//! endpoint reported at one point in time. It is never updated in place: after
//! anything that may have changed the volume, build a new one.

pub mod parser;

use crate::btrfs::Btrfs;
use crate::command::ToolRunner;
use crate::transport::Transport;
use crate::utils::{CloneError, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// One subvolume as reported by the listing tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub id: u64,
    pub identity: String,
    pub relative_path: String,
    /// Empty when the subvolume was not cloned from another one
    pub parent_identity: String,
    /// Empty unless the subvolume was created by a receive
    pub received_identity: String,
}

impl SnapshotRecord {
    pub fn has_parent(&self) -> bool {
        !self.parent_identity.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    records: Vec<SnapshotRecord>,
}

impl Inventory {
    /// Build an inventory, ordered by id whatever order the records came in.
    pub fn from_records(mut records: Vec<SnapshotRecord>) -> Self {
        records.sort_by_key(|r| r.id);
        Self { records }
    }

    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SnapshotRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_identity(&self, identity: &str) -> Option<&SnapshotRecord> {
        if identity.is_empty() {
            return None;
        }
        self.records.iter().find(|r| r.identity == identity)
    }

    pub fn paths(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.relative_path.as_str()).collect()
    }

    /// Records that declare a parent
    pub fn parent_count(&self) -> usize {
        self.records.iter().filter(|r| r.has_parent()).count()
    }

    /// Records whose declared parent is not in this inventory. Expected after
    /// retention pruning; not an error.
    pub fn orphans(&self) -> Vec<&SnapshotRecord> {
        let identities: HashSet<&str> = self.records.iter().map(|r| r.identity.as_str()).collect();
        self.records
            .iter()
            .filter(|r| r.has_parent() && !identities.contains(r.parent_identity.as_str()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Inventory {
    type Item = &'a SnapshotRecord;
    type IntoIter = std::slice::Iter<'a, SnapshotRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Result of parsing a listing: the inventory plus every rejected line.
///
/// A non-empty `rejected` means the inventory is incomplete. Whether that is
/// fatal is the caller's decision.
#[derive(Debug, Default)]
pub struct Listing {
    pub inventory: Inventory,
    pub rejected: Vec<CloneError>,
}

impl Listing {
    pub fn is_degraded(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Parse full listing output. Blank lines are ignored; duplicate ids or
/// identities are rejected like malformed lines.
pub fn parse_listing(output: &str) -> Listing {
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    let mut ids = HashSet::new();
    let mut identities = HashSet::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parser::parse_line(line) {
            Ok(record) => {
                if !ids.insert(record.id) {
                    rejected.push(duplicate(line, "duplicate ID"));
                } else if !record.identity.is_empty() && !identities.insert(record.identity.clone()) {
                    rejected.push(duplicate(line, "duplicate uuid"));
                } else {
                    records.push(record);
                }
            }
            Err(e) => rejected.push(e),
        }
    }

    Listing {
        inventory: Inventory::from_records(records),
        rejected,
    }
}

fn duplicate(line: &str, reason: &str) -> CloneError {
    CloneError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

/// Lists an endpoint's subvolumes.
pub struct InventoryBuilder<'a> {
    runner: &'a ToolRunner,
    btrfs: &'a Btrfs,
}

impl<'a> InventoryBuilder<'a> {
    pub fn new(runner: &'a ToolRunner, btrfs: &'a Btrfs) -> Self {
        Self { runner, btrfs }
    }

    /// List `transport`'s volume; `read_only` restricts to read-only snapshots.
    pub async fn build(&self, transport: &dyn Transport, read_only: bool) -> Result<Listing> {
        debug!("Building subvolume list for {}", transport.origin());
        let out = self
            .runner
            .query(transport, self.btrfs.list(transport.tool_root(), read_only))
            .await?;

        let listing = parse_listing(&out.stdout);
        if listing.is_degraded() {
            warn!(
                "{} unreadable line(s) in subvolume list for {}",
                listing.rejected.len(),
                transport.origin()
            );
        }
        debug!(
            "{} subvolumes listed for {}",
            listing.inventory.len(),
            transport.origin()
        );
        Ok(listing)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Shorthand record for tests across the crate.
    pub(crate) fn record(id: u64, identity: &str, path: &str, parent: &str, received: &str) -> SnapshotRecord {
        SnapshotRecord {
            id,
            identity: identity.to_string(),
            relative_path: path.to_string(),
            parent_identity: parent.to_string(),
            received_identity: received.to_string(),
        }
    }

    #[test]
    fn test_sorted_by_id() {
        let inv = Inventory::from_records(vec![
            record(30, "C", "c", "", ""),
            record(10, "A", "a", "", ""),
            record(20, "B", "b", "", ""),
        ]);
        let ids: Vec<u64> = inv.iter().map(|r| r.id).collect();
        assert_eq!(ids, [10, 20, 30]);
    }

    #[test]
    fn test_orphans() {
        let inv = Inventory::from_records(vec![
            record(1, "A", "a", "", ""),
            record(2, "B", "b", "A", ""),
            record(3, "C", "c", "Z", ""),
        ]);
        let orphans: Vec<&str> = inv.orphans().iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(orphans, ["C"]);
        assert_eq!(inv.parent_count(), 2);
    }

    #[test]
    fn test_by_identity_ignores_empty() {
        let inv = Inventory::from_records(vec![record(1, "", "a", "", "")]);
        assert!(inv.by_identity("").is_none());
    }

    #[test]
    fn test_parse_listing_collects_rejects() {
        let output = "\
ID 258 gen 9 top level 5 parent_uuid - received_uuid - uuid B path h/2
not a subvolume line
ID 257 gen 8 top level 5 parent_uuid - received_uuid - uuid A path h/1

ID 257 gen 8 top level 5 parent_uuid - received_uuid - uuid X path h/3
";
        let listing = parse_listing(output);
        assert!(listing.is_degraded());
        assert_eq!(listing.rejected.len(), 2);
        let paths: Vec<&str> = listing.inventory.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, ["h/1", "h/2"]);
    }

    #[test]
    fn test_parse_empty_listing() {
        let listing = parse_listing("");
        assert!(!listing.is_degraded());
        assert!(listing.inventory.is_empty());
    }
}
