//! Source retrieval: download, checksum verification, caching and unpacking.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};
use crate::error::{FarrierError, Result, Stage};
use crate::formula::Formula;
use crate::global::ArchiveCache;
use crate::util::sha256_file;

/// Where a formula's `url` points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Http(String),
    Local(PathBuf),
}

impl SourceLocation {
    pub fn parse(url: &str) -> Option<SourceLocation> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(SourceLocation::Http(url.to_string()))
        } else if let Some(path) = url.strip_prefix("file://") {
            Some(SourceLocation::Local(PathBuf::from(path)))
        } else if !url.contains("://") {
            Some(SourceLocation::Local(PathBuf::from(url)))
        } else {
            None
        }
    }
}

/// Downloads source archives into the [`ArchiveCache`] after verifying them.
///
/// Every download goes to a temp file inside the cache directory first. The
/// temp file is deleted on any failure; only an archive whose SHA-256 matches
/// the formula is moved into the cache.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    cache: ArchiveCache,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(cache: ArchiveCache, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("farrier/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, cache, timeout })
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Fetches the source of `formula` and returns the verified archive path.
    pub fn fetch(&self, formula: &Formula) -> Result<PathBuf> {
        self.fetch_url(&formula.name, &formula.url, &formula.sha256)
    }

    /// Fetches `url` on behalf of `formula`, verifying it against `expected`.
    ///
    /// # Errors
    ///
    /// * [`FarrierError::ChecksumMismatch`] if the bytes hash differently.
    /// * [`FarrierError::Timeout`] if the HTTP transfer exceeds the timeout.
    /// * [`FarrierError::Fetch`] for other transfer failures.
    pub fn fetch_url(&self, formula: &str, url: &str, expected: &str) -> Result<PathBuf> {
        if let Some(cached) = self.cache.get_cached_archive(expected, url) {
            match sha256_file(&cached) {
                Ok(actual) if actual == expected => {
                    info!("{}: using cached {}", formula, cached.display());
                    return Ok(cached);
                }
                _ => {
                    warn!("{}: cached archive {} is corrupt, fetching again", formula, cached.display());
                    if let Err(e) = self.cache.remove_cached_archive(expected) {
                        warn!("{}: cannot remove {}: {e}", formula, cached.display());
                    }
                }
            }
        }

        let mut download = self
            .cache
            .temp_file()
            .map_err(FarrierError::io(formula, Stage::Fetch, "creating download file"))?;
        info!("{}: fetching {}", formula, url);
        self.download(formula, url, download.as_file_mut())?;

        let actual = sha256_file(download.path())
            .map_err(FarrierError::io(formula, Stage::Fetch, "hashing download"))?;
        if actual != expected {
            return Err(FarrierError::ChecksumMismatch {
                formula: formula.to_string(),
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        self.cache
            .store(download, expected, url)
            .map_err(FarrierError::io(formula, Stage::Fetch, "storing download in cache"))
    }

    fn download(&self, formula: &str, url: &str, out: &mut fs::File) -> Result<()> {
        let fetch_error = |reason: String| FarrierError::Fetch {
            formula: formula.to_string(),
            url: url.to_string(),
            reason,
        };
        match SourceLocation::parse(url) {
            Some(SourceLocation::Http(url)) => {
                let mut response = self
                    .client
                    .get(&url)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| self.transfer_error(formula, &url, e))?;
                let bytes = response
                    .copy_to(out)
                    .map_err(|e| self.transfer_error(formula, &url, e))?;
                debug!("{}: downloaded {} bytes", formula, bytes);
            }
            Some(SourceLocation::Local(path)) => {
                let mut source = fs::File::open(&path)
                    .map_err(|e| fetch_error(format!("cannot open {}: {e}", path.display())))?;
                io::copy(&mut source, out).map_err(|e| fetch_error(e.to_string()))?;
            }
            None => return Err(fetch_error("unsupported url scheme".to_string())),
        }
        out.sync_all()
            .map_err(FarrierError::io(formula, Stage::Fetch, "flushing download"))
    }

    fn transfer_error(&self, formula: &str, url: &str, e: reqwest::Error) -> FarrierError {
        if e.is_timeout() {
            FarrierError::Timeout {
                formula: formula.to_string(),
                stage: Stage::Fetch,
                seconds: self.timeout.as_secs(),
            }
        } else {
            FarrierError::Fetch {
                formula: formula.to_string(),
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Unpacks `archive` into `dest` and returns the source root.
///
/// `.tar.gz`, `.tgz`, `.tar` and `.zip` are extracted; any other file is
/// copied into `dest` unchanged. When the archive holds a single top-level
/// directory, that directory is the source root.
pub fn extract_archive(formula: &str, archive: &Path, dest: &Path) -> Result<PathBuf> {
    let io_err = |context: &str| FarrierError::io(formula, Stage::Fetch, format!("{context} {}", archive.display()));
    fs::create_dir_all(dest).map_err(io_err("creating extraction dir for"))?;

    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    // Cache entries are `<sha256>--<name>`.
    let original_name = file_name
        .split_once("--")
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| file_name.clone());

    info!("{}: unpacking {}", formula, original_name);
    if original_name.ends_with(".tar.gz") || original_name.ends_with(".tgz") {
        let file = fs::File::open(archive).map_err(io_err("opening"))?;
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder)
            .unpack(dest)
            .map_err(io_err("unpacking"))?;
    } else if original_name.ends_with(".tar") {
        let file = fs::File::open(archive).map_err(io_err("opening"))?;
        tar::Archive::new(file)
            .unpack(dest)
            .map_err(io_err("unpacking"))?;
    } else if original_name.ends_with(".zip") {
        let file = fs::File::open(archive).map_err(io_err("opening"))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| io_err("reading")(io::Error::other(e)))?;
        zip.extract(dest)
            .map_err(|e| io_err("unpacking")(io::Error::other(e)))?;
    } else {
        fs::copy(archive, dest.join(&original_name)).map_err(io_err("copying"))?;
        return Ok(dest.to_path_buf());
    }

    source_root(dest).map_err(io_err("inspecting"))
}

fn source_root(dest: &Path) -> io::Result<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn make_tarball(dir: &Path) -> PathBuf {
        let path = dir.join("tool-1.0.tar.gz");
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let content = b"hello";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "tool-1.0/README", &content[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn fetcher(cache_dir: &Path) -> Fetcher {
        Fetcher::new(ArchiveCache::new(cache_dir), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_source_location() {
        assert_eq!(
            SourceLocation::parse("https://example.com/a.tar.gz"),
            Some(SourceLocation::Http("https://example.com/a.tar.gz".to_string()))
        );
        assert_eq!(
            SourceLocation::parse("file:///srv/a.tar.gz"),
            Some(SourceLocation::Local(PathBuf::from("/srv/a.tar.gz")))
        );
        assert_eq!(
            SourceLocation::parse("/srv/a.tar.gz"),
            Some(SourceLocation::Local(PathBuf::from("/srv/a.tar.gz")))
        );
        assert_eq!(SourceLocation::parse("ftp://example.com/a.tar.gz"), None);
    }

    #[test]
    fn test_fetch_local_verifies_and_caches() {
        let src = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let tarball = make_tarball(src.path());
        let sha = sha256_file(&tarball).unwrap();
        let url = format!("file://{}", tarball.display());

        let fetcher = fetcher(cache.path());
        let archive = fetcher.fetch_url("tool", &url, &sha).unwrap();
        assert!(archive.starts_with(cache.path()));
        assert_eq!(sha256_file(&archive).unwrap(), sha);

        // Second fetch is served from the cache even if the source is gone.
        fs::remove_file(&tarball).unwrap();
        assert_eq!(fetcher.fetch_url("tool", &url, &sha).unwrap(), archive);
    }

    #[test]
    fn test_checksum_mismatch_leaves_nothing_behind() {
        let src = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let tarball = make_tarball(src.path());
        let url = tarball.display().to_string();
        let wrong = "0".repeat(64);

        let err = fetcher(cache.path()).fetch_url("tool", &url, &wrong).unwrap_err();
        match err {
            FarrierError::ChecksumMismatch { expected, actual, .. } => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, sha256_file(&tarball).unwrap());
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_cache_entry_is_refetched() {
        let src = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        let tarball = make_tarball(src.path());
        let sha = sha256_file(&tarball).unwrap();
        let url = tarball.display().to_string();
        let fetcher = fetcher(cache_dir.path());

        let cached = fetcher.cache().path_for(&sha, &url);
        fs::write(&cached, b"garbage").unwrap();
        let archive = fetcher.fetch_url("tool", &url, &sha).unwrap();
        assert_eq!(sha256_file(&archive).unwrap(), sha);
        assert_eq!(fetcher.cache().entries().unwrap(), vec![archive]);
    }

    #[test]
    fn test_stalled_http_transfer_times_out() {
        use std::net::TcpListener;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept the connection and never answer.
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(3));
        });

        let cache = tempdir().unwrap();
        let fetcher = Fetcher::new(ArchiveCache::new(cache.path()), Duration::from_secs(1)).unwrap();
        let err = fetcher
            .fetch_url("tool", &format!("http://127.0.0.1:{port}/tool-1.0.tar.gz"), &"0".repeat(64))
            .unwrap_err();
        assert!(
            matches!(err, FarrierError::Timeout { stage: Stage::Fetch, seconds: 1, .. }),
            "{err:?}"
        );
        assert_eq!(err.exit_code(), 3);
        assert!(fetcher.cache().entries().unwrap().is_empty());
        server.join().unwrap();
    }

    #[test]
    fn test_missing_local_source() {
        let cache = tempdir().unwrap();
        let err = fetcher(cache.path())
            .fetch_url("tool", "/does/not/exist.tar.gz", &"0".repeat(64))
            .unwrap_err();
        assert!(matches!(err, FarrierError::Fetch { .. }));
        assert_eq!(err.stage(), Stage::Fetch);
        assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_extract_tarball_finds_single_root() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let tarball = make_tarball(src.path());
        let root = extract_archive("tool", &tarball, dest.path()).unwrap();
        assert_eq!(root, dest.path().join("tool-1.0"));
        assert_eq!(fs::read_to_string(root.join("README")).unwrap(), "hello");
    }

    #[test]
    fn test_extract_zip() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let path = src.path().join("abc--tool.zip");
        let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        zip.start_file("a.txt", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"a").unwrap();
        zip.start_file("b.txt", zip::write::SimpleFileOptions::default()).unwrap();
        zip.write_all(b"b").unwrap();
        zip.finish().unwrap();

        let root = extract_archive("tool", &path, dest.path()).unwrap();
        assert_eq!(root, dest.path());
        assert_eq!(fs::read_to_string(root.join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn test_plain_file_is_copied() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let path = src.path().join("abc--install.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let root = extract_archive("tool", &path, dest.path()).unwrap();
        assert!(root.join("install.sh").exists());
    }
}
