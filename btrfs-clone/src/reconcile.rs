//! Source/destination matching.
//!
//! Decides which source snapshots still need sending, which already have a
//! received copy at the destination, which destination items have no source
//! counterpart, and which snapshot can serve as the incremental basis for a
//! send.

use crate::inventory::{Inventory, SnapshotRecord};
use crate::utils::CloneError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// A source snapshot and the destination copy received from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPair {
    pub source: SnapshotRecord,
    pub destination: SnapshotRecord,
}

/// Destination items with no source counterpart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Strays {
    /// Relative subvolume paths, deepest first
    pub subvolumes: Vec<String>,
    /// Top-level directory names
    pub directories: Vec<String>,
}

impl Strays {
    pub fn is_empty(&self) -> bool {
        self.subvolumes.is_empty() && self.directories.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Source snapshots without a destination copy, in id order
    pub pending: Vec<SnapshotRecord>,
    pub matched: Vec<MatchedPair>,
    /// Stray subvolumes; directories once [`Reconciliation::add_stray_directories`] ran
    pub strays: Strays,
    /// Source snapshots with more than one destination copy
    pub conflicts: Vec<CloneError>,
}

/// `dst` is a received copy of `src` at the same relative path.
pub fn corresponds(dst: &SnapshotRecord, src: &SnapshotRecord) -> bool {
    !dst.received_identity.is_empty()
        && (dst.received_identity == src.identity || dst.received_identity == src.received_identity)
        && dst.relative_path == src.relative_path
}

/// Every destination record corresponding to `src`. More than one is an
/// invariant violation the caller must report.
pub fn find_corresponding<'a>(src: &SnapshotRecord, dst: &'a Inventory) -> Vec<&'a SnapshotRecord> {
    dst.iter().filter(|d| corresponds(d, src)).collect()
}

/// Classify every source and destination record.
pub fn reconcile(src: &Inventory, dst: &Inventory) -> Reconciliation {
    let mut result = Reconciliation::default();

    for source in src {
        match find_corresponding(source, dst).as_slice() {
            [] => result.pending.push(source.clone()),
            [destination] => result.matched.push(MatchedPair {
                source: source.clone(),
                destination: (*destination).clone(),
            }),
            many => result.conflicts.push(CloneError::AmbiguousMatch {
                path: source.relative_path.clone(),
                count: many.len(),
            }),
        }
    }

    result.strays.subvolumes = stray_subvolumes(src, dst);
    debug!(
        "Reconciled: {} pending, {} matched, {} stray subvolumes, {} conflicts",
        result.pending.len(),
        result.matched.len(),
        result.strays.subvolumes.len(),
        result.conflicts.len()
    );
    result
}

impl Reconciliation {
    /// Classify the top-level directories of both volumes, see
    /// [`stray_directories`].
    pub fn add_stray_directories(
        &mut self,
        source_dirs: &BTreeSet<String>,
        destination_dirs: &BTreeSet<String>,
        dst: &Inventory,
        excluded: Option<&str>,
    ) {
        self.strays.directories = stray_directories(source_dirs, destination_dirs, dst, excluded);
    }
}

/// Destination paths no source record shares, deepest first so that nested
/// subvolumes go before the ones containing them.
pub fn stray_subvolumes(src: &Inventory, dst: &Inventory) -> Vec<String> {
    let source_paths = src.paths();
    let mut strays: Vec<String> = dst
        .paths()
        .into_iter()
        .filter(|p| !source_paths.contains(p))
        .map(str::to_string)
        .collect();
    strays.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
    strays
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Top-level destination directories with no source directory of the same
/// name and no destination subvolume at that path. `excluded` (the auxiliary
/// rsync target) is never a stray.
pub fn stray_directories(
    source_dirs: &BTreeSet<String>,
    destination_dirs: &BTreeSet<String>,
    dst: &Inventory,
    excluded: Option<&str>,
) -> Vec<String> {
    let subvolume_paths: HashSet<&str> = dst.paths();
    destination_dirs
        .iter()
        .filter(|d| !source_dirs.contains(*d))
        .filter(|d| !subvolume_paths.contains(d.as_str()))
        .filter(|d| Some(d.as_str()) != excluded)
        .cloned()
        .collect()
}

/// Live checks against the source volume used when picking an incremental parent.
#[async_trait]
pub trait SnapshotProbe: Send + Sync {
    /// The snapshot's path still exists on disk
    async fn exists(&self, relative_path: &str) -> bool;

    /// The snapshot is read-only right now
    async fn is_read_only(&self, relative_path: &str) -> bool;
}

/// Pick the incremental basis for a pending snapshot.
///
/// The parent must be declared, present in the source inventory, still on
/// disk and read-only. Any miss means a full send, never an error.
pub async fn select_parent<'a>(
    pending: &SnapshotRecord,
    src: &'a Inventory,
    probe: &dyn SnapshotProbe,
) -> Option<&'a SnapshotRecord> {
    if !pending.has_parent() {
        return None;
    }
    let Some(parent) = src.by_identity(&pending.parent_identity) else {
        debug!("Parent of {} is not in the source inventory", pending.relative_path);
        return None;
    };
    if !probe.exists(&parent.relative_path).await {
        debug!("Parent {} no longer exists", parent.relative_path);
        return None;
    }
    if !probe.is_read_only(&parent.relative_path).await {
        debug!("Parent {} is not read-only", parent.relative_path);
        return None;
    }
    Some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::record;

    struct FakeProbe {
        existing: Vec<&'static str>,
        read_only: Vec<&'static str>,
    }

    #[async_trait]
    impl SnapshotProbe for FakeProbe {
        async fn exists(&self, relative_path: &str) -> bool {
            self.existing.contains(&relative_path)
        }

        async fn is_read_only(&self, relative_path: &str) -> bool {
            self.read_only.contains(&relative_path)
        }
    }

    #[test]
    fn test_correspondence_relation() {
        let src = record(1, "A", "h/2024", "", "");
        assert!(corresponds(&record(9, "X", "h/2024", "", "A"), &src));
        assert!(!corresponds(&record(9, "Y", "h/2025", "", "A"), &src));
        assert!(!corresponds(&record(9, "Z", "h/2024", "", ""), &src));
        assert!(!corresponds(&record(9, "Z", "h/2024", "", "B"), &src));
    }

    #[test]
    fn test_correspondence_through_received_identity() {
        // the source itself was received from somewhere else
        let src = record(1, "A", "h/2024", "", "ORIG");
        assert!(corresponds(&record(9, "X", "h/2024", "", "ORIG"), &src));
    }

    #[test]
    fn test_empty_received_never_matches_empty_source_received() {
        let src = record(1, "A", "h/2024", "", "");
        let dst = record(9, "X", "h/2024", "", "");
        assert!(!corresponds(&dst, &src));
    }

    #[test]
    fn test_reconcile_pending_and_matched() {
        let src = Inventory::from_records(vec![
            record(1, "A", "h/1", "", ""),
            record(2, "B", "h/2", "A", ""),
            record(3, "C", "h/3", "B", ""),
        ]);
        let dst = Inventory::from_records(vec![
            record(10, "X", "h/1", "", "A"),
            record(11, "Y", "h/2", "X", "B"),
        ]);

        let r = reconcile(&src, &dst);
        assert_eq!(r.matched.len(), 2);
        assert_eq!(r.pending.len(), 1);
        assert_eq!(r.pending[0].identity, "C");
        assert!(r.strays.is_empty());
        assert!(r.conflicts.is_empty());
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let src = Inventory::from_records(vec![
            record(1, "A", "h/1", "", ""),
            record(2, "B", "h/2", "A", ""),
        ]);
        let dst = Inventory::from_records(vec![
            record(5, "X", "h/1", "", "A"),
            record(6, "Y", "h/2", "X", "B"),
        ]);
        assert!(reconcile(&src, &dst).pending.is_empty());
    }

    #[test]
    fn test_multiple_matches_are_conflicts() {
        let src = Inventory::from_records(vec![record(1, "A", "h/1", "", "")]);
        let dst = Inventory::from_records(vec![
            record(10, "X", "h/1", "", "A"),
            record(11, "Y", "h/1", "", "A"),
        ]);
        let r = reconcile(&src, &dst);
        assert!(r.pending.is_empty());
        assert!(r.matched.is_empty());
        assert!(matches!(
            r.conflicts.as_slice(),
            [CloneError::AmbiguousMatch { count: 2, .. }]
        ));
    }

    #[test]
    fn test_stray_subvolumes_by_path() {
        let src = Inventory::from_records(vec![record(1, "A", "a", "", ""), record(2, "B", "b", "", "")]);
        let dst = Inventory::from_records(vec![
            record(1, "X", "a", "", "A"),
            record(2, "Y", "b", "", "B"),
            record(3, "Z", "c", "", "C"),
        ]);
        assert_eq!(reconcile(&src, &dst).strays.subvolumes, ["c"]);
    }

    #[test]
    fn test_diverged_identity_on_shared_path_is_not_stray() {
        let src = Inventory::from_records(vec![record(1, "A", "a", "", "")]);
        let dst = Inventory::from_records(vec![record(1, "X", "a", "", "OTHER")]);
        let r = reconcile(&src, &dst);
        assert!(r.strays.subvolumes.is_empty());
        assert_eq!(r.pending.len(), 1);
    }

    #[test]
    fn test_stray_subvolumes_deepest_first() {
        let src = Inventory::default();
        let dst = Inventory::from_records(vec![
            record(1, "X", "old", "", ""),
            record(2, "Y", "old/nested/deep", "", ""),
            record(3, "Z", "old/nested", "", ""),
        ]);
        assert_eq!(stray_subvolumes(&src, &dst), ["old/nested/deep", "old/nested", "old"]);
    }

    #[test]
    fn test_stray_directories() {
        let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        let dst = Inventory::from_records(vec![record(1, "X", "snapdir", "", "")]);
        let strays = stray_directories(
            &set(&["clients", "host1"]),
            &set(&["clients", "host1", "host2", "snapdir", "_urbcb_misc_backups"]),
            &dst,
            Some("_urbcb_misc_backups"),
        );
        assert_eq!(strays, ["host2"]);
    }

    #[test]
    fn test_reconciliation_collects_both_kinds_of_strays() {
        let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        let src = Inventory::from_records(vec![record(1, "A", "host1/1", "", "")]);
        let dst = Inventory::from_records(vec![
            record(10, "X", "host1/1", "", "A"),
            record(11, "Y", "gone/1", "", "Q"),
        ]);

        let mut r = reconcile(&src, &dst);
        assert!(r.strays.directories.is_empty());
        r.add_stray_directories(&set(&["host1"]), &set(&["host1", "gone", "empty"]), &dst, None);

        assert_eq!(r.strays.subvolumes, ["gone/1"]);
        assert_eq!(r.strays.directories, ["empty", "gone"]);
    }

    #[tokio::test]
    async fn test_select_parent_valid() {
        let src = Inventory::from_records(vec![record(1, "A", "h/1", "", ""), record(2, "B", "h/2", "A", "")]);
        let probe = FakeProbe { existing: vec!["h/1"], read_only: vec!["h/1"] };
        let parent = select_parent(&src.records()[1], &src, &probe).await;
        assert_eq!(parent.map(|p| p.relative_path.as_str()), Some("h/1"));
    }

    #[tokio::test]
    async fn test_select_parent_falls_back_to_full() {
        let src = Inventory::from_records(vec![record(1, "A", "h/1", "", ""), record(2, "B", "h/2", "A", "")]);
        let pending = &src.records()[1];

        let pruned = FakeProbe { existing: vec![], read_only: vec!["h/1"] };
        assert!(select_parent(pending, &src, &pruned).await.is_none());

        let writable = FakeProbe { existing: vec!["h/1"], read_only: vec![] };
        assert!(select_parent(pending, &src, &writable).await.is_none());

        let orphan = record(3, "C", "h/3", "Z", "");
        let probe = FakeProbe { existing: vec!["h/1"], read_only: vec!["h/1"] };
        assert!(select_parent(&orphan, &src, &probe).await.is_none());

        let root = record(4, "D", "h/4", "", "");
        assert!(select_parent(&root, &src, &probe).await.is_none());
    }
}
