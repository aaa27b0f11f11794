//! Extraction results
//!
//! A [`FileList`] is the ordered output of one extraction pass. Entries
//! flagged `temporary` were created by the pipeline and are deleted by it
//! unless ownership moves elsewhere (a hook or a relocation clears the flag).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub temporary: bool,
}

impl FileEntry {
    /// A file the pipeline created and owns
    pub fn temporary(path: impl Into<PathBuf>, mime_type: Option<String>) -> Self {
        Self {
            path: path.into(),
            mime_type,
            temporary: true,
        }
    }

    /// A file that belongs to someone else
    pub fn external(path: impl Into<PathBuf>, mime_type: Option<String>) -> Self {
        Self {
            path: path.into(),
            mime_type,
            temporary: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileList {
    entries: Vec<FileEntry>,
}

impl FileList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FileEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, FileEntry> {
        self.entries.iter_mut()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    /// Keep only the entries `f` accepts
    pub fn retain(&mut self, f: impl FnMut(&FileEntry) -> bool) {
        self.entries.retain(f);
    }

    /// Delete every file still owned by the list and clear those entries.
    /// Returns how many files were removed from disk.
    pub fn delete_temporary(&mut self) -> usize {
        let mut deleted = 0;
        for entry in self.entries.iter().filter(|e| e.temporary) {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("[FileList] could not delete {}: {}", entry.path.display(), e),
            }
        }
        self.entries.retain(|e| !e.temporary);
        deleted
    }
}

impl FromIterator<FileEntry> for FileList {
    fn from_iter<T: IntoIterator<Item = FileEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FileList {
    type Item = FileEntry;
    type IntoIter = std::vec::IntoIter<FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileList {
    type Item = &'a FileEntry;
    type IntoIter = std::slice::Iter<'a, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl std::ops::Index<usize> for FileList {
    type Output = FileEntry;

    fn index(&self, index: usize) -> &FileEntry {
        &self.entries[index]
    }
}
