//! Discovery and fingerprinting of store source files.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::Result;

/// A source file with the attributes that decide whether it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub len: u64,
    /// Modification time in nanoseconds since the epoch, when available.
    pub modified: Option<u128>,
}

/// The sorted set of source files under one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSet {
    pub files: Vec<SourceFile>,
}

impl SourceSet {
    /// Collect files under `root` whose extension is in `extensions`
    /// (case-insensitive). A missing directory is an empty set.
    pub fn scan(root: impl AsRef<Path>, extensions: &[String]) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Ok(Self::default());
        }

        let mut files = Vec::new();
        let entries = WalkDir::new(root).follow_links(true).into_iter();
        for entry in entries.filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry.path().extension().and_then(|e| e.to_str()).is_some_and(|ext| {
                extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext))
            });
            if !matches {
                continue;
            }
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos());
            files.push(SourceFile { path: entry.into_path(), len: meta.len(), modified });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { files })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// SHA-256 over every file's path, size, and modification time.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update(file.len.to_le_bytes());
            hasher.update(file.modified.unwrap_or_default().to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// File stem of `path` as an identifier (`"ifrs_s1"` for `ifrs_s1.txt`).
pub(crate) fn source_name(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scans_matching_extensions_only() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::write(root.join("nested/a.MD"), "a").unwrap();
        fs::write(root.join("skip.pdf"), "x").unwrap();

        let set = SourceSet::scan(root, &["txt".to_string(), "md".to_string()]).unwrap();
        let names: Vec<_> = set.files.iter().map(|f| source_name(&f.path)).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn fingerprint_tracks_content_changes() {
        let temp = tempfile::tempdir().unwrap();
        let exts = ["csv".to_string()];
        let before = SourceSet::scan(temp.path(), &exts).unwrap().fingerprint();
        fs::write(temp.path().join("list.csv"), "category,criterion,description\n").unwrap();
        let after = SourceSet::scan(temp.path(), &exts).unwrap().fingerprint();
        assert_ne!(before, after);
        assert_eq!(after, SourceSet::scan(temp.path(), &exts).unwrap().fingerprint());
    }

    #[test]
    fn missing_directory_is_empty() {
        let set = SourceSet::scan("/definitely/not/here", &["txt".to_string()]).unwrap();
        assert!(set.is_empty());
    }
}
