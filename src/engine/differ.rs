use std::collections::BTreeSet;

use log::debug;

use crate::engine::models::{Entry, Manifest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// Marked `deleted` upstream.
    Deleted,
    /// On disk but no longer listed by any active entry.
    Orphan,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub relative: String,
    pub reason: Removal,
}

#[derive(Clone, Debug, Default)]
pub struct Diff {
    pub missing: Vec<Entry>,
    pub removals: Vec<Candidate>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.removals.is_empty()
    }
}

/// Reconcile remote-active, remote-deleted and local-actual paths.
///
/// A path is wanted when at least one active entry lists it. Deleted entries
/// are never downloaded, and are removed unless another active entry still
/// wants the same path. Local files outside the wanted set are orphans.
pub fn diff(manifest: &Manifest, local: &BTreeSet<String>) -> Diff {
    let wanted: BTreeSet<&str> = manifest.active().map(|e| e.remote_path.as_str()).collect();

    let mut missing = Vec::new();
    let mut queued = BTreeSet::new();
    for entry in manifest.active() {
        let path = entry.remote_path.as_str();
        if !local.contains(path) && queued.insert(path) {
            missing.push(entry.clone());
        }
    }

    let mut removals = Vec::new();
    let mut doomed = BTreeSet::new();
    for entry in manifest.deleted() {
        let path = entry.remote_path.as_str();
        if wanted.contains(path) {
            debug!("diff: {path} is deleted in {} but still active elsewhere", entry.category);
            continue;
        }
        if doomed.insert(path.to_owned()) {
            removals.push(Candidate {
                relative: path.to_owned(),
                reason: Removal::Deleted,
            });
        }
    }
    for path in local {
        if !wanted.contains(path.as_str()) && doomed.insert(path.clone()) {
            removals.push(Candidate {
                relative: path.clone(),
                reason: Removal::Orphan,
            });
        }
    }

    Diff { missing, removals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::EntryStatus;
    use serde_json::Value;

    fn entry(path: &str, status: EntryStatus) -> Entry {
        Entry {
            category: "Banners".into(),
            remote_path: path.into(),
            status,
            metadata: Value::Null,
        }
    }

    fn local(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn removal_paths(diff: &Diff) -> Vec<(&str, Removal)> {
        diff.removals
            .iter()
            .map(|c| (c.relative.as_str(), c.reason))
            .collect()
    }

    #[test]
    fn classifies_missing_deleted_and_orphans() {
        let manifest = Manifest {
            entries: vec![
                entry("a.png", EntryStatus::Active),
                entry("b.png", EntryStatus::Active),
                entry("c.png", EntryStatus::Deleted),
            ],
        };
        let diff = diff(&manifest, &local(&["a.png", "c.png", "stale.png"]));
        let missing: Vec<_> = diff.missing.iter().map(|e| e.remote_path.as_str()).collect();
        assert_eq!(missing, ["b.png"]);
        assert_eq!(
            removal_paths(&diff),
            [("c.png", Removal::Deleted), ("stale.png", Removal::Orphan)]
        );
    }

    #[test]
    fn deleted_entries_are_never_missing() {
        let manifest = Manifest {
            entries: vec![entry("gone.mp4", EntryStatus::Deleted)],
        };
        let diff = diff(&manifest, &BTreeSet::new());
        assert!(diff.missing.is_empty());
        // Scheduled regardless of local presence; the pruner treats absence as done.
        assert_eq!(removal_paths(&diff), [("gone.mp4", Removal::Deleted)]);
    }

    #[test]
    fn active_reference_protects_shared_path() {
        let manifest = Manifest {
            entries: vec![
                entry("shared.mp4", EntryStatus::Deleted),
                entry("shared.mp4", EntryStatus::Active),
            ],
        };
        let diff = diff(&manifest, &local(&["shared.mp4"]));
        assert!(diff.is_empty());
    }

    #[test]
    fn duplicate_active_entries_download_once() {
        let manifest = Manifest {
            entries: vec![
                entry("promo.mp4", EntryStatus::Active),
                entry("promo.mp4", EntryStatus::Active),
            ],
        };
        assert_eq!(diff(&manifest, &BTreeSet::new()).missing.len(), 1);
    }

    #[test]
    fn in_sync_tree_has_nothing_to_do() {
        let manifest = Manifest {
            entries: vec![entry("a.png", EntryStatus::Active)],
        };
        assert!(diff(&manifest, &local(&["a.png"])).is_empty());
    }

    #[test]
    fn empty_manifest_orphans_everything() {
        let diff = diff(&Manifest::default(), &local(&["x.mp4", "y.mp4.part"]));
        assert_eq!(diff.removals.len(), 2);
        assert!(diff.removals.iter().all(|c| c.reason == Removal::Orphan));
    }
}
