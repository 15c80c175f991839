//! Client-side table of contents mirroring the server's file set.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::paths::{normalize_path, parent_of};

/// What the server says about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStamp {
    /// Regular file with its modification time in unix milliseconds.
    File(i64),
    Directory,
    /// Server confirms the path does not exist.
    Absent,
}

impl FileStamp {
    pub fn millis(&self) -> Option<i64> {
        match self {
            FileStamp::File(ms) => Some(*ms),
            _ => None,
        }
    }

    pub fn entry(&self) -> Option<TocEntry> {
        match self {
            FileStamp::File(ms) => Some(TocEntry::File(*ms)),
            FileStamp::Directory => Some(TocEntry::Directory),
            FileStamp::Absent => None,
        }
    }
}

/// A TOC entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocEntry {
    File(i64),
    Directory,
}

impl From<TocEntry> for FileStamp {
    fn from(entry: TocEntry) -> Self {
        match entry {
            TocEntry::File(ms) => FileStamp::File(ms),
            TocEntry::Directory => FileStamp::Directory,
        }
    }
}

/// Entries of one directory keyed by their full normalized path.
pub type Directory = HashMap<String, TocEntry>;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 rendering for logs.
pub fn format_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.to_rfc3339(),
        None => format!("{}ms", ms),
    }
}

/// Directory path -> entries.
#[derive(Debug, Default, Clone)]
pub struct ServerToc {
    directories: HashMap<String, Directory>,
}

impl ServerToc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `path`, creating its parent directory entry if absent.
    /// Directories also get their own (possibly empty) listing.
    pub fn add_file_or_directory(&mut self, path: &str, entry: TocEntry) {
        let path = normalize_path(path);
        if entry == TocEntry::Directory {
            self.directories.entry(path.clone()).or_default();
        }
        let parent = parent_of(&path).to_string();
        self.directories.entry(parent).or_default().insert(path, entry);
    }

    /// Modification time of a file the server knows about.
    pub fn find_file(&self, path: &str) -> Option<i64> {
        let path = normalize_path(path);
        match self.directories.get(parent_of(&path))?.get(&path)? {
            TocEntry::File(ms) => Some(*ms),
            TocEntry::Directory => None,
        }
    }

    pub fn find_directory(&self, path: &str) -> Option<&Directory> {
        self.directories.get(&normalize_path(path))
    }

    pub fn find(&self, path: &str) -> Option<TocEntry> {
        let path = normalize_path(path);
        if let Some(entry) = self
            .directories
            .get(parent_of(&path))
            .and_then(|d| d.get(&path))
        {
            return Some(*entry);
        }
        self.directories.get(&path).map(|_| TocEntry::Directory)
    }

    /// Retracts a file, or a directory and its listing. Returns how many entries went away.
    pub fn remove_file_or_directory(&mut self, path: &str) -> usize {
        let path = normalize_path(path);
        let mut removed = 0;
        if let Some(dir) = self.directories.get_mut(parent_of(&path)) {
            if dir.remove(&path).is_some() {
                removed += 1;
            }
        }
        if let Some(listing) = self.directories.remove(&path) {
            removed += listing.len();
            // Anything nested below goes too
            let prefix = format!("{}/", path);
            let nested: Vec<String> = self
                .directories
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in nested {
                if let Some(listing) = self.directories.remove(&key) {
                    removed += listing.len();
                }
            }
        }
        removed
    }

    /// All known files with their timestamps.
    pub fn files(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.directories.values().flat_map(|dir| {
            dir.iter().filter_map(|(path, entry)| match entry {
                TocEntry::File(ms) => Some((path.as_str(), *ms)),
                TocEntry::Directory => None,
            })
        })
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_and_directories_are_distinguished() {
        let mut toc = ServerToc::new();
        toc.add_file_or_directory("Content", TocEntry::Directory);
        toc.add_file_or_directory("Content/Maps/level.umap", TocEntry::File(42));

        assert_eq!(toc.find_file("Content/Maps/level.umap"), Some(42));
        assert_eq!(toc.find_file("Content"), None);
        assert!(toc.find_directory("Content").is_some());
        assert!(toc.find_directory("Content/Maps").is_some());
        assert!(toc.find_directory("Content/Missing").is_none());
        assert_eq!(toc.find("Content"), Some(TocEntry::Directory));
        assert_eq!(toc.find("Content/Maps"), Some(TocEntry::Directory));
    }

    #[test]
    fn lookups_normalize_paths() {
        let mut toc = ServerToc::new();
        toc.add_file_or_directory("Content\\Hero.uasset", TocEntry::File(7));
        assert_eq!(toc.find_file("./Content/Hero.uasset"), Some(7));
        assert_eq!(toc.find_file("Content//Hero.uasset/"), Some(7));
    }

    #[test]
    fn re_adding_updates_timestamp() {
        let mut toc = ServerToc::new();
        toc.add_file_or_directory("a.ini", TocEntry::File(1));
        toc.add_file_or_directory("a.ini", TocEntry::File(2));
        assert_eq!(toc.find_file("a.ini"), Some(2));
        assert_eq!(toc.file_count(), 1);
    }

    #[test]
    fn remove_reports_count_and_is_idempotent() {
        let mut toc = ServerToc::new();
        toc.add_file_or_directory("Content/a.uasset", TocEntry::File(1));
        toc.add_file_or_directory("Content/b.uasset", TocEntry::File(1));
        assert_eq!(toc.remove_file_or_directory("Content/a.uasset"), 1);
        assert_eq!(toc.remove_file_or_directory("Content/a.uasset"), 0);
        assert_eq!(toc.find_file("Content/a.uasset"), None);
        assert_eq!(toc.find_file("Content/b.uasset"), Some(1));
    }

    #[test]
    fn removing_directory_drops_nested_listings() {
        let mut toc = ServerToc::new();
        toc.add_file_or_directory("Content", TocEntry::Directory);
        toc.add_file_or_directory("Content/Maps", TocEntry::Directory);
        toc.add_file_or_directory("Content/Maps/level.umap", TocEntry::File(3));
        let removed = toc.remove_file_or_directory("Content");
        assert!(removed >= 3);
        assert!(toc.find_directory("Content/Maps").is_none());
        assert_eq!(toc.find_file("Content/Maps/level.umap"), None);
    }

    #[test]
    fn stamp_entry_conversion() {
        assert_eq!(FileStamp::File(5).entry(), Some(TocEntry::File(5)));
        assert_eq!(FileStamp::Absent.entry(), None);
        assert_eq!(FileStamp::from(TocEntry::Directory), FileStamp::Directory);
        assert_eq!(FileStamp::File(9).millis(), Some(9));
    }
}
