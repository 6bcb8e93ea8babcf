use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid regex"));

/// Directory under the prefix holding farrier's own state.
pub const STATE_DIR: &str = "var/farrier";

/// Ensures the prefix layout exists under the given root path.
/// Creates `bin`, `share/man` and `var/farrier/receipts` if they don't already exist.
///
/// Returns the prefix path.
pub fn ensure_prefix_dirs<P: AsRef<Path>>(root: P) -> io::Result<PathBuf> {
    let path = PathBuf::from(root.as_ref());
    fs::create_dir_all(path.join("bin"))?;
    fs::create_dir_all(path.join("share").join("man"))?;
    fs::create_dir_all(receipts_dir(&path))?;
    Ok(path)
}

/// Returns the directory receipts are stored in for the given prefix.
pub fn receipts_dir<P: AsRef<Path>>(prefix: P) -> PathBuf {
    prefix.as_ref().join(STATE_DIR).join("receipts")
}

/// Strips the `sha256:` prefix from a hash if present.
/// This is useful for formatting hashes uniformly.
pub fn format_hash(hash: &str) -> String {
    if let Some(hash) = hash.strip_prefix("sha256:") {
        hash.to_string()
    } else {
        hash.to_string()
    }
}

/// Lower-cases a checksum and strips the `sha256:` prefix.
/// Returns `None` unless the result is 64 hex digits.
pub fn normalize_sha256(hash: &str) -> Option<String> {
    let hash = format_hash(hash.trim()).to_ascii_lowercase();
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash)
    } else {
        None
    }
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Last path segment of a URL, without query or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Replaces `{key}` placeholders with values from `vars`.
/// Unknown placeholders are kept verbatim.
pub fn expand_placeholders(template: &str, vars: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Checks if a given path is an executable file on Unix.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
/// Checks if a given path has a Windows executable extension (.exe, .bat, .cmd).
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        matches!(ext.as_str(), "exe" | "bat" | "cmd")
    } else {
        false
    }
}

/// Adds the executable bits to a file (no-op off Unix).
pub fn set_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Lists every file below `dir` relative to `dir`, sorted.
pub fn relative_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() || entry.file_type().is_symlink() {
            if let Ok(rel) = entry.path().strip_prefix(dir) {
                files.push(rel.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Removes empty directories from `start` upwards, stopping at `stop` (exclusive).
pub fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
