//! Working-directory snapshots and before/after diffs.
//!
//! The scanner only reads metadata. It never writes to or removes anything
//! from the directory it inspects.

use crate::errors::{Result, SandboxError};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Identity of a file version: modification time and length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub len: u64,
}

/// Regular files under a directory, keyed by `/`-separated relative name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, FileStamp>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FileStamp> {
        self.files.get(name)
    }
}

/// Detects files created or modified in a working directory
#[derive(Debug, Clone, Default)]
pub struct ArtifactScanner {
    recursive: bool,
    extensions: Vec<String>,
}

impl ArtifactScanner {
    /// Flat scanner reporting every file
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk subdirectories as well
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Only report files whose extension matches one of `extensions`
    /// (case-insensitive, without the dot). Empty reports every file.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    /// Record every regular file under `dir`. Directories and symlinks are skipped.
    pub fn snapshot(&self, dir: &Path) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        self.collect(dir, "", &mut snapshot)?;
        debug!("[SANDBOX] Snapshot of {:?}: {} files", dir, snapshot.len());
        Ok(snapshot)
    }

    fn collect(&self, dir: &Path, prefix: &str, snapshot: &mut Snapshot) -> Result<()> {
        let snapshot_err = |source| SandboxError::Snapshot {
            path: dir.to_path_buf(),
            source,
        };

        for entry in std::fs::read_dir(dir).map_err(snapshot_err)? {
            let entry = entry.map_err(snapshot_err)?;
            // Files can vanish between readdir and stat while the guest is still winding down.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if file_type.is_dir() {
                if self.recursive {
                    self.collect(&entry.path(), &rel, snapshot)?;
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            snapshot.files.insert(
                rel,
                FileStamp {
                    modified,
                    len: meta.len(),
                },
            );
        }
        Ok(())
    }

    /// Names present in `after` but not in `before`, or whose stamp moved
    /// forward or changed length, in lexical order.
    pub fn diff(&self, before: &Snapshot, after: &Snapshot) -> Vec<String> {
        after
            .files
            .iter()
            .filter(|(name, stamp)| match before.files.get(*name) {
                None => true,
                Some(old) => stamp.modified > old.modified || stamp.len != old.len,
            })
            .filter(|(name, _)| self.matches_extension(name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn matches_extension(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}
