//! Where changelog documents come from.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use super::paths;

/// Supplier of changelog documents addressed by logical path.
pub trait ChangelogSource {
    /// Read a document.
    fn read(&self, path: &str) -> io::Result<String>;

    /// List the files directly inside a directory, as logical paths.
    fn list(&self, dir: &str) -> io::Result<Vec<String>>;
}

/// Documents on the local filesystem, addressed relative to a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemSource {
    root: PathBuf,
}

impl FileSystemSource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in paths::normalize(path).split('/') {
            if !segment.is_empty() {
                full.push(segment);
            }
        }
        full
    }
}

impl ChangelogSource for FileSystemSource {
    fn read(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(self.full_path(path))
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let base = paths::normalize(dir);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(self.full_path(&base))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(if base.is_empty() {
                name
            } else {
                format!("{}/{}", base, name)
            });
        }
        files.sort();
        Ok(files)
    }
}

/// In-memory documents, mostly for tests and embedded changelogs.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<String, String>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn with_file(mut self, path: impl AsRef<str>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    /// Add or replace a document in place.
    pub fn insert(&mut self, path: impl AsRef<str>, content: impl Into<String>) {
        self.files
            .insert(paths::normalize(path.as_ref()), content.into());
    }
}

impl ChangelogSource for MemorySource {
    fn read(&self, path: &str) -> io::Result<String> {
        self.files
            .get(&paths::normalize(path))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path)))
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let base = paths::normalize(dir);
        let files: Vec<String> = self
            .files
            .keys()
            .filter(|path| paths::parent(path) == base)
            .cloned()
            .collect();
        if files.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory {} not found", dir),
            ));
        }
        Ok(files)
    }
}
