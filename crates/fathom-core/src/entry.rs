//! Remote filesystem model — entries, listings and recursive scan trees.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Type tag of a remote filesystem entry.
///
/// Symlinks are *not* a kind: "is a symlink" is derived from a non-empty
/// `link_target`, independent of the type tag (a symlink to a directory is
/// `Dir` with a link target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Dir,
    CharDevice,
    BlockDevice,
}

impl Default for EntryKind {
    fn default() -> Self {
        Self::File
    }
}

/// One parsed entry of a remote directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub filename: String,
    pub owner: String,
    pub group: String,
    /// Symlink target; empty when the entry is not a symlink.
    pub link_target: String,
    /// Unix permission bits (lower 12 bits meaningful).
    pub permissions: u32,
    pub size: u64,
    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
}

impl Default for DirectoryEntry {
    fn default() -> Self {
        Self {
            filename: String::new(),
            owner: String::new(),
            group: String::new(),
            link_target: String::new(),
            permissions: 0,
            size: 0,
            kind: EntryKind::File,
            modified: None,
        }
    }
}

impl DirectoryEntry {
    pub fn is_symlink(&self) -> bool {
        !self.link_target.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Externally supplied ordering priority: higher sorts earlier.
pub type PriorityFn<'a> = dyn Fn(&DirectoryEntry) -> i32 + 'a;

/// Order entries by priority (descending), then directories before files,
/// then filename (ascending).
pub fn compare_entries(a: &DirectoryEntry, b: &DirectoryEntry, priority: &PriorityFn) -> Ordering {
    priority(b)
        .cmp(&priority(a))
        .then_with(|| b.is_dir().cmp(&a.is_dir()))
        .then_with(|| a.filename.cmp(&b.filename))
}

/// An ordered directory listing plus the URL it was fetched for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    /// Normalized URL this listing was fetched for.
    pub url: String,
    pub valid: bool,
    entries: Vec<DirectoryEntry>,
}

impl DirectoryListing {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            valid: true,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: DirectoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirectoryEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, filename: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.filename == filename)
    }

    /// Patch one entry's size in place — used to refresh a cached listing
    /// after an upload completes without a fresh fetch.
    pub fn update_entry_size(&mut self, filename: &str, size: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.filename == filename) {
            Some(entry) => {
                entry.size = size;
                true
            }
            None => false,
        }
    }

    pub fn sort_with(&mut self, priority: &PriorityFn) {
        self.entries.sort_by(|a, b| compare_entries(a, b, priority));
    }

    /// Default ordering: directories first, filename ascending.
    pub fn sort(&mut self) {
        self.sort_with(&|_| 0);
    }
}

/// A node of a recursive directory scan. Owns its subtree exclusively:
/// dropping a node drops everything beneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryTree {
    pub entry: DirectoryEntry,
    files: Vec<DirectoryEntry>,
    subdirs: Vec<DirectoryTree>,
}

impl DirectoryTree {
    pub fn new(entry: DirectoryEntry) -> Self {
        Self {
            entry,
            files: Vec::new(),
            subdirs: Vec::new(),
        }
    }

    pub fn add_file(&mut self, entry: DirectoryEntry) {
        self.files.push(entry);
    }

    pub fn add_subdir(&mut self, tree: DirectoryTree) {
        self.subdirs.push(tree);
    }

    pub fn files(&self) -> &[DirectoryEntry] {
        &self.files
    }

    pub fn subdirs(&self) -> &[DirectoryTree] {
        &self.subdirs
    }

    /// Total number of file entries in this subtree.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.subdirs.iter().map(|d| d.file_count()).sum::<usize>()
    }

    /// Total byte size of all files in this subtree.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.subdirs.iter().map(|d| d.total_size()).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> DirectoryEntry {
        DirectoryEntry {
            filename: name.into(),
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn symlink_derived_from_link_target() {
        let mut e = entry("latest", EntryKind::Dir);
        assert!(!e.is_symlink());
        e.link_target = "/releases/2.0".into();
        assert!(e.is_symlink());
        assert!(e.is_dir());
    }

    #[test]
    fn ordering_dirs_before_files_then_name() {
        let mut listing = DirectoryListing::new("ftp://host/");
        listing.add_entry(entry("zeta.txt", EntryKind::File));
        listing.add_entry(entry("beta", EntryKind::Dir));
        listing.add_entry(entry("alpha.txt", EntryKind::File));
        listing.add_entry(entry("alpha", EntryKind::Dir));
        listing.sort();
        let names: Vec<_> = listing.entries().iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "alpha.txt", "zeta.txt"]);
    }

    #[test]
    fn ordering_priority_wins_over_kind() {
        let mut listing = DirectoryListing::new("ftp://host/");
        listing.add_entry(entry("dir", EntryKind::Dir));
        listing.add_entry(entry("urgent.txt", EntryKind::File));
        listing.sort_with(&|e| if e.filename == "urgent.txt" { 10 } else { 0 });
        assert_eq!(listing.entries()[0].filename, "urgent.txt");
    }

    #[test]
    fn update_entry_size_patches_in_place() {
        let mut listing = DirectoryListing::new("ftp://host/");
        let mut e = entry("upload.bin", EntryKind::File);
        e.size = 10;
        listing.add_entry(e);
        assert!(listing.update_entry_size("upload.bin", 4096));
        assert_eq!(listing.find("upload.bin").unwrap().size, 4096);
        assert!(!listing.update_entry_size("missing", 1));
    }

    #[test]
    fn tree_totals() {
        let mut root = DirectoryTree::new(entry("root", EntryKind::Dir));
        let mut sub = DirectoryTree::new(entry("sub", EntryKind::Dir));
        let mut f1 = entry("a", EntryKind::File);
        f1.size = 100;
        let mut f2 = entry("b", EntryKind::File);
        f2.size = 50;
        sub.add_file(f2);
        root.add_file(f1);
        root.add_subdir(sub);
        assert_eq!(root.file_count(), 2);
        assert_eq!(root.total_size(), 150);
    }
}
