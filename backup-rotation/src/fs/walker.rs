//! Directory traversal over finished backups.
//!
//! Incremental backups share unchanged files with their link base through
//! hard links, so the interesting number is not the tree's apparent size but
//! the bytes held only by this backup (files whose link count is 1).

use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Information about a regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Hard link count
    pub links: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        Ok(Self {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            links: metadata.nlink(),
        })
    }

    /// Not shared with any other backup.
    pub fn is_unique(&self) -> bool {
        self.links <= 1
    }
}

/// Space accounting for one backup tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Footprint {
    pub files: u64,
    /// Apparent size of every file in the tree
    pub total_bytes: u64,
    /// Size of files not hard-linked from elsewhere
    pub unique_bytes: u64,
}

impl Footprint {
    pub fn unique_gb(&self) -> f64 {
        self.unique_bytes as f64 / (1u64 << 30) as f64
    }
}

/// Walk a directory tree with a callback for each regular file. Symbolic
/// links are skipped, never followed.
///
/// # Returns
/// * `Ok(())` - If walk completed successfully
/// * `Err(io::Error)` - If directory cannot be read
pub fn walk_directory_with_callback<F>(root: &Path, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        callback(&FileInfo::from_entry(&entry)?);
    }

    Ok(())
}

/// Measure a finished backup.
pub fn measure_footprint(root: &Path) -> std::io::Result<Footprint> {
    let mut footprint = Footprint::default();

    walk_directory_with_callback(root, |file| {
        footprint.files += 1;
        footprint.total_bytes += file.size;
        if file.is_unique() {
            footprint.unique_bytes += file.size;
        }
    })?;

    Ok(footprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let footprint = measure_footprint(temp_dir.path())?;
        assert_eq!(footprint, Footprint::default());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"1234567")?;

        let mut seen = Vec::new();
        walk_directory_with_callback(temp_dir.path(), |f| seen.push(f.path.clone()))?;
        assert_eq!(seen.len(), 2);

        let footprint = measure_footprint(temp_dir.path())?;
        assert_eq!(footprint.files, 2);
        assert_eq!(footprint.total_bytes, 12);
        assert_eq!(footprint.unique_bytes, 12);

        Ok(())
    }

    #[test]
    fn test_hard_links_are_not_unique() -> std::io::Result<()> {
        let base = TempDir::new()?;
        let next = TempDir::new_in(base.path())?;

        let shared = base.path().join("shared.bin");
        fs::write(&shared, vec![0u8; 100])?;
        fs::hard_link(&shared, next.path().join("shared.bin"))?;
        fs::write(next.path().join("changed.bin"), vec![1u8; 10])?;

        let footprint = measure_footprint(next.path())?;
        assert_eq!(footprint.files, 2);
        assert_eq!(footprint.total_bytes, 110);
        assert_eq!(footprint.unique_bytes, 10);

        Ok(())
    }

    #[test]
    fn test_symlinks_are_not_followed() -> std::io::Result<()> {
        let outside = TempDir::new()?;
        fs::write(outside.path().join("big.bin"), vec![0u8; 1000])?;

        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("small.txt"), b"abc")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link"))?;

        let footprint = measure_footprint(temp_dir.path())?;
        assert_eq!(footprint.files, 1);
        assert_eq!(footprint.total_bytes, 3);

        Ok(())
    }
}
