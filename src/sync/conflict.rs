//! Initial reconciliation and conflict resolution.
//!
//! [`reconcile`] is a pure comparison of the two indices taken at
//! `InitialSync`. It never deletes: a path present on one side only is copied
//! to the other.

use serde::Deserialize;

use crate::sync::exclude::ExclusionFilter;
use crate::sync::index::{FileEntry, FileIndex};

/// Which side wins when both sides hold diverging versions of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictAuthority {
    /// Always keep the local version.
    LocalWins,
    /// Always keep the remote version.
    RemoteWins,
    /// Keep the version with the later modification time (default).
    /// Equal times fall back to the local version.
    #[default]
    NewestWins,
}

impl ConflictAuthority {
    /// Get a human-readable description of the strategy.
    pub fn description(&self) -> &'static str {
        match self {
            Self::LocalWins => "Always use local",
            Self::RemoteWins => "Always use remote",
            Self::NewestWins => "Use most recently modified file",
        }
    }
}

impl std::str::FromStr for ConflictAuthority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-wins" | "local" => Ok(Self::LocalWins),
            "remote-wins" | "remote" => Ok(Self::RemoteWins),
            "newest-wins" | "newest" => Ok(Self::NewestWins),
            other => Err(format!(
                "unknown conflict authority {:?} (expected local-wins, remote-wins or newest-wins)",
                other
            )),
        }
    }
}

/// The result of resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
}

/// Decide which version of a diverging path to keep.
pub fn resolve(local: &FileEntry, remote: &FileEntry, authority: ConflictAuthority) -> Resolution {
    match authority {
        ConflictAuthority::LocalWins => Resolution::UseLocal,
        ConflictAuthority::RemoteWins => Resolution::UseRemote,
        ConflictAuthority::NewestWins => {
            if remote.mod_time > local.mod_time {
                Resolution::UseRemote
            } else {
                Resolution::UseLocal
            }
        }
    }
}

/// A path that differed on both sides, with how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub local: FileEntry,
    pub remote: FileEntry,
    pub resolution: Resolution,
}

/// One transfer the initial sync has to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Send the local entry to the remote side.
    Upload(FileEntry),
    /// Fetch the remote entry into the local tree.
    Download(FileEntry),
}

impl ReconcileAction {
    pub fn path(&self) -> &str {
        match self {
            Self::Upload(entry) | Self::Download(entry) => &entry.path,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Transfers in path order (parents before children).
    pub actions: Vec<ReconcileAction>,
    /// Paths that differed on both sides.
    pub conflicts: Vec<Conflict>,
    /// Paths already identical on both sides.
    pub unchanged: usize,
    /// Paths skipped because of directional excludes.
    pub skipped: usize,
}

impl ReconcilePlan {
    pub fn uploads(&self) -> impl Iterator<Item = &FileEntry> {
        self.actions.iter().filter_map(|a| match a {
            ReconcileAction::Upload(entry) => Some(entry),
            ReconcileAction::Download(_) => None,
        })
    }

    pub fn downloads(&self) -> impl Iterator<Item = &FileEntry> {
        self.actions.iter().filter_map(|a| match a {
            ReconcileAction::Download(entry) => Some(entry),
            ReconcileAction::Upload(_) => None,
        })
    }
}

/// Compare both indices and plan the transfers for every path on either side.
pub fn reconcile(
    local: &FileIndex,
    remote: &FileIndex,
    filter: &ExclusionFilter,
    authority: ConflictAuthority,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let mut paths: Vec<&String> = local.paths().chain(remote.paths()).collect();
    paths.sort();
    paths.dedup();

    for path in paths {
        match (local.get(path), remote.get(path)) {
            (Some(l), None) => {
                if filter.is_upload_visible(path, l.is_dir) {
                    plan.actions.push(ReconcileAction::Upload(l.clone()));
                } else {
                    plan.skipped += 1;
                }
            }
            (None, Some(r)) => {
                if filter.is_download_visible(path, r.is_dir) {
                    plan.actions.push(ReconcileAction::Download(r.clone()));
                } else {
                    plan.skipped += 1;
                }
            }
            (Some(l), Some(r)) => {
                if l.same_content(r) {
                    plan.unchanged += 1;
                    continue;
                }

                let resolution = resolve(l, r, authority);
                plan.conflicts.push(Conflict {
                    path: path.clone(),
                    local: l.clone(),
                    remote: r.clone(),
                    resolution,
                });

                match resolution {
                    Resolution::UseLocal if filter.is_upload_visible(path, l.is_dir) => {
                        plan.actions.push(ReconcileAction::Upload(l.clone()));
                    }
                    Resolution::UseRemote if filter.is_download_visible(path, r.is_dir) => {
                        plan.actions.push(ReconcileAction::Download(r.clone()));
                    }
                    _ => plan.skipped += 1,
                }
            }
            (None, None) => {}
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::exclude::ExcludePatterns;

    fn file(path: &str, size: u64, mod_time: i64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            mod_time,
            is_dir: false,
            is_symlink: false,
        }
    }

    fn dir(path: &str, mod_time: i64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size: 0,
            mod_time,
            is_dir: true,
            is_symlink: false,
        }
    }

    fn index(entries: Vec<FileEntry>) -> FileIndex {
        entries.into_iter().collect()
    }

    #[test]
    fn test_one_sided_paths_are_copied() {
        let local = index(vec![dir("a", 1), file("a/b.txt", 3, 10)]);
        let remote = index(vec![file("r.txt", 5, 10)]);

        let plan = reconcile(&local, &remote, &ExclusionFilter::default(), ConflictAuthority::NewestWins);

        let uploads: Vec<&str> = plan.uploads().map(|e| e.path.as_str()).collect();
        let downloads: Vec<&str> = plan.downloads().map(|e| e.path.as_str()).collect();
        assert_eq!(uploads, vec!["a", "a/b.txt"]);
        assert_eq!(downloads, vec!["r.txt"]);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn test_identical_and_directories_do_not_conflict() {
        let local = index(vec![dir("src", 1), file("src/lib.rs", 3, 10)]);
        let remote = index(vec![dir("src", 99), file("src/lib.rs", 3, 10)]);

        let plan = reconcile(&local, &remote, &ExclusionFilter::default(), ConflictAuthority::NewestWins);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_newest_wins_for_all_permutations() {
        for (local_time, remote_time) in [(100, 200), (200, 100), (1, 2), (2, 1)] {
            let local = index(vec![file("x.txt", 10, local_time)]);
            let remote = index(vec![file("x.txt", 10, remote_time)]);

            let plan = reconcile(&local, &remote, &ExclusionFilter::default(), ConflictAuthority::NewestWins);
            assert_eq!(plan.actions.len(), 1);

            if local_time > remote_time {
                assert_eq!(plan.actions[0], ReconcileAction::Upload(file("x.txt", 10, local_time)));
            } else {
                assert_eq!(plan.actions[0], ReconcileAction::Download(file("x.txt", 10, remote_time)));
            }
        }
    }

    #[test]
    fn test_equal_times_prefer_local() {
        let l = file("x.txt", 10, 50);
        let r = file("x.txt", 11, 50);
        assert_eq!(resolve(&l, &r, ConflictAuthority::NewestWins), Resolution::UseLocal);
    }

    #[test]
    fn test_configured_authority_overrides_times() {
        let l = file("x.txt", 10, 50);
        let r = file("x.txt", 11, 10);
        assert_eq!(resolve(&l, &r, ConflictAuthority::RemoteWins), Resolution::UseRemote);
        assert_eq!(resolve(&r, &l, ConflictAuthority::LocalWins), Resolution::UseLocal);
    }

    #[test]
    fn test_directional_excludes_are_respected() {
        let filter = ExclusionFilter::new(
            ExcludePatterns::new(),
            ExcludePatterns::from_patterns(&["*.secret"]).unwrap(),
            ExcludePatterns::from_patterns(&["logs/"]).unwrap(),
        );
        let local = index(vec![file("k.secret", 1, 1)]);
        let remote = index(vec![dir("logs", 1), file("logs/app.log", 1, 1)]);

        let plan = reconcile(&local, &remote, &filter, ConflictAuthority::NewestWins);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.skipped, 3);
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!("local-wins".parse::<ConflictAuthority>().unwrap(), ConflictAuthority::LocalWins);
        assert_eq!("remote".parse::<ConflictAuthority>().unwrap(), ConflictAuthority::RemoteWins);
        assert!("sometimes".parse::<ConflictAuthority>().is_err());
    }
}
