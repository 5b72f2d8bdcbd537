//! File entries and per-side indices.
//!
//! Each side of a session owns one [`FileIndex`]: an ordered map from
//! relative path to [`FileEntry`]. Indices are never shared across sides;
//! comparison happens on snapshots.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use crate::error::{Result, SyncError};
use crate::sync::exclude::ExclusionFilter;

/// Metadata of one path inside a sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// `/`-separated path relative to the sync root.
    pub path: String,
    pub size: u64,
    /// Modification time in whole unix seconds.
    pub mod_time: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileEntry {
    pub fn from_metadata(path: impl Into<String>, metadata: &Metadata) -> Self {
        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            path: path.into(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mod_time,
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
        }
    }

    /// Stat `rel` under `root` without following a final symlink.
    /// Returns `Ok(None)` if the path does not exist.
    pub fn stat(root: &Path, rel: &str) -> Result<Option<Self>> {
        let full = join_relative(root, rel);
        match std::fs::symlink_metadata(&full) {
            Ok(metadata) => Ok(Some(Self::from_metadata(rel, &metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::file(full, e)),
        }
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.mod_time, 0)
    }

    /// Same content as far as the sync engine can tell: same kind, size and
    /// modification second.
    pub fn same_content(&self, other: &FileEntry) -> bool {
        self.is_dir == other.is_dir
            && (self.is_dir || (self.size == other.size && self.mod_time == other.mod_time))
    }
}

/// Ordered mapping from relative path to entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    entries: BTreeMap<String, FileEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    /// Remove `path` and, if it is a directory, everything below it.
    /// Returns the number of entries removed.
    pub fn remove_tree(&mut self, path: &str) -> usize {
        let before = self.entries.len();
        self.entries.remove(path);
        let prefix = format!("{}/", path);
        self.entries.retain(|p, _| !p.starts_with(&prefix));
        before - self.entries.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }
}

impl FromIterator<FileEntry> for FileIndex {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        let mut index = FileIndex::new();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}

/// Lock a shared index; a poisoned lock still holds usable data.
pub(crate) fn lock(index: &Mutex<FileIndex>) -> MutexGuard<'_, FileIndex> {
    index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Convert an absolute path below `root` to its `/`-separated relative form.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Join a relative protocol path onto a root, refusing anything that would
/// escape it.
pub fn join_relative(root: &Path, rel: &str) -> PathBuf {
    let mut full = root.to_path_buf();
    for part in rel.split('/') {
        match part {
            "" | "." | ".." => continue,
            part => full.push(part),
        }
    }
    full
}

/// Whether a path received over the wire is a clean relative path.
pub fn is_safe_relative(rel: &str) -> bool {
    !rel.is_empty()
        && !rel.starts_with('/')
        && !rel.contains('\\')
        && rel.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Enumerate every entry below `root` that is not hidden by the general set.
///
/// Runs a blocking directory walk; call from `spawn_blocking`.
pub fn scan_tree(root: &Path, filter: &ExclusionFilter) -> Result<FileIndex> {
    let metadata = std::fs::metadata(root).map_err(|e| SyncError::LocalRootUnavailable {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !metadata.is_dir() {
        return Err(SyncError::LocalRootUnavailable {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut index = FileIndex::new();
    let walker = jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        let path = entry.path();
        // The root itself has no relative form.
        let Some(rel) = relative_path(root, &path) else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        if filter.is_excluded(&rel, is_dir) {
            continue;
        }

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) => {
                index.insert(FileEntry::from_metadata(rel, &metadata));
            }
            Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::exclude::ExcludePatterns;
    use tempfile::tempdir;

    fn entry(path: &str, size: u64, mod_time: i64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
            mod_time,
            is_dir: false,
            is_symlink: false,
        }
    }

    #[test]
    fn test_remove_tree() {
        let mut index: FileIndex = vec![
            entry("a", 0, 0),
            entry("a/b.txt", 1, 1),
            entry("a/c/d.txt", 1, 1),
            entry("ab.txt", 1, 1),
        ]
        .into_iter()
        .collect();

        assert_eq!(index.remove_tree("a"), 3);
        assert!(index.contains("ab.txt"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove_tree("missing"), 0);
    }

    #[test]
    fn test_same_content() {
        assert!(entry("a", 3, 10).same_content(&entry("a", 3, 10)));
        assert!(!entry("a", 3, 10).same_content(&entry("a", 4, 10)));
        assert!(!entry("a", 3, 10).same_content(&entry("a", 3, 11)));
    }

    #[test]
    fn test_path_helpers() {
        let root = Path::new("/srv/app");
        assert_eq!(relative_path(root, Path::new("/srv/app/src/main.rs")).as_deref(), Some("src/main.rs"));
        assert_eq!(relative_path(root, Path::new("/srv/app")), None);
        assert_eq!(relative_path(root, Path::new("/etc/passwd")), None);

        assert_eq!(join_relative(root, "../../etc/passwd"), PathBuf::from("/srv/app/etc/passwd"));
        assert!(is_safe_relative("a/b.txt"));
        assert!(!is_safe_relative("../a"));
        assert!(!is_safe_relative("/abs"));
        assert!(!is_safe_relative("a//b"));
    }

    #[test]
    fn test_scan_tree_applies_general_excludes() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();

        let filter = ExclusionFilter::general_only(ExcludePatterns::from_patterns(&[".git/"]).unwrap());
        let index = scan_tree(dir.path(), &filter).unwrap();

        let paths: Vec<&String> = index.paths().collect();
        assert_eq!(paths, vec!["src", "src/main.rs"]);
        assert_eq!(index.get("src/main.rs").unwrap().size, 12);
        assert!(index.get("src").unwrap().is_dir);
    }

    #[test]
    fn test_scan_missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let err = scan_tree(&dir.path().join("gone"), &ExclusionFilter::default()).unwrap_err();
        assert!(err.is_fatal());
    }
}
