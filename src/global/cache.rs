use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;
use crate::util::file_name_from_url;

const TEMP_PREFIX: &str = ".download-";

/// Content-addressed store of verified source archives.
///
/// Entries are named `<sha256>--<file name>`, so two formulas pointing at the
/// same bytes share one download. Only verified archives are ever stored;
/// in-flight downloads live in hidden temp files that delete themselves.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    dir: PathBuf,
}

/// What [`ArchiveCache::clean_cache`] removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub files: usize,
    pub bytes: u64,
}

impl ArchiveCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sha256: &str, url: &str) -> PathBuf {
        let file_name = file_name_from_url(url).unwrap_or_else(|| "source".to_string());
        self.dir.join(format!("{sha256}--{file_name}"))
    }

    pub fn get_cached_archive(&self, sha256: &str, url: &str) -> Option<PathBuf> {
        let path = self.path_for(sha256, url);
        path.is_file().then_some(path)
    }

    /// A fresh temp file inside the cache directory, deleted when dropped.
    pub fn temp_file(&self) -> io::Result<NamedTempFile> {
        fs::create_dir_all(&self.dir)?;
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
    }

    /// Moves a verified download into the cache.
    pub fn store(&self, download: NamedTempFile, sha256: &str, url: &str) -> io::Result<PathBuf> {
        let path = self.path_for(sha256, url);
        download.persist(&path).map_err(|e| e.error)?;
        debug!("cached {}", path.display());
        Ok(path)
    }

    /// Removes every cached archive whose checksum is `sha256`.
    pub fn remove_cached_archive(&self, sha256: &str) -> io::Result<usize> {
        let prefix = format!("{sha256}--");
        let mut removed = 0;
        for path in self.entries()? {
            let matches = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix));
            if matches {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes everything in the cache directory.
    pub fn clean_cache(&self) -> io::Result<CleanStats> {
        let mut stats = CleanStats::default();
        if !self.dir.exists() {
            return Ok(stats);
        }
        for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                stats.files += 1;
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        Ok(stats)
    }

    /// Cached archives, sorted. In-flight temp files are not listed.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if path.is_file() && !hidden {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}
