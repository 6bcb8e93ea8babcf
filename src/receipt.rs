use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use crate::formula::Formula;
use crate::util::receipts_dir;

const RECEIPT_EXT: &str = "json";
const PENDING_EXT: &str = "json.partial";

/// On-disk record of what an install put into the prefix.
///
/// Stored as `<prefix>/var/farrier/receipts/<name>.json`. A receipt is
/// written once, after every file was copied, and deleted on uninstall.
/// While an install is running the same record is kept as
/// `<name>.json.partial`, so an interrupted install can be recognised later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub source_url: String,
    pub sha256: String,
    /// Runtime dependencies at install time; used to refuse unsafe uninstalls.
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    /// Installed files, relative to the prefix, sorted.
    pub files: Vec<PathBuf>,
    pub installed_at: DateTime<Utc>,
}

impl InstallReceipt {
    pub fn new(formula: &Formula, mut files: Vec<PathBuf>) -> Self {
        files.sort();
        files.dedup();
        Self {
            name: formula.name.clone(),
            version: formula.version.clone(),
            source_url: formula.url.clone(),
            sha256: formula.sha256.clone(),
            runtime_dependencies: formula.runtime_dependencies(),
            files,
            installed_at: Utc::now(),
        }
    }

    /// Path of the receipt for `name` under `prefix`.
    pub fn path<P: AsRef<Path>>(prefix: P, name: &str) -> PathBuf {
        receipts_dir(prefix).join(format!("{name}.{RECEIPT_EXT}"))
    }

    /// Path of the pending receipt for `name` under `prefix`.
    pub fn pending_path<P: AsRef<Path>>(prefix: P, name: &str) -> PathBuf {
        receipts_dir(prefix).join(format!("{name}.{PENDING_EXT}"))
    }

    /// Loads the receipt of an installed formula, `None` if not installed.
    pub fn load<P: AsRef<Path>>(prefix: P, name: &str) -> io::Result<Option<Self>> {
        read_receipt(&Self::path(prefix, name))
    }

    /// Loads the pending receipt of an interrupted or running install.
    pub fn load_pending<P: AsRef<Path>>(prefix: P, name: &str) -> io::Result<Option<Self>> {
        read_receipt(&Self::pending_path(prefix, name))
    }

    pub fn is_installed<P: AsRef<Path>>(prefix: P, name: &str) -> bool {
        Self::path(prefix, name).is_file()
    }

    /// Writes the final receipt atomically and drops the pending one.
    pub fn save<P: AsRef<Path>>(&self, prefix: P) -> io::Result<()> {
        let prefix = prefix.as_ref();
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path(prefix, &self.name), &content)?;
        remove_if_exists(&Self::pending_path(prefix, &self.name))
    }

    /// Writes the pending receipt atomically.
    pub fn save_pending<P: AsRef<Path>>(&self, prefix: P) -> io::Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::pending_path(prefix, &self.name), &content)
    }

    /// Deletes both the receipt and any pending receipt of `name`.
    pub fn remove<P: AsRef<Path>>(prefix: P, name: &str) -> io::Result<()> {
        let prefix = prefix.as_ref();
        remove_if_exists(&Self::path(prefix, name))?;
        remove_if_exists(&Self::pending_path(prefix, name))
    }

    /// All complete receipts under `prefix`, sorted by name.
    pub fn all<P: AsRef<Path>>(prefix: P) -> io::Result<Vec<Self>> {
        list_receipts(prefix.as_ref(), RECEIPT_EXT)
    }

    /// All pending receipts under `prefix`, sorted by name.
    pub fn all_pending<P: AsRef<Path>>(prefix: P) -> io::Result<Vec<Self>> {
        list_receipts(prefix.as_ref(), PENDING_EXT)
    }

    /// True if both receipts describe the same install, ignoring when it happened.
    pub fn same_install(&self, other: &InstallReceipt) -> bool {
        Self {
            installed_at: other.installed_at,
            ..self.clone()
        } == *other
    }
}

/// Writes `bytes` to a temp file next to `path`, then renames it over `path`.
/// Readers see either the old or the new content, never a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_receipt(path: &Path) -> io::Result<Option<InstallReceipt>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn list_receipts(prefix: &Path, ext: &str) -> io::Result<Vec<InstallReceipt>> {
    let dir = receipts_dir(prefix);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let suffix = format!(".{ext}");
    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        let is_match = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(&suffix))
            .unwrap_or(false);
        if !is_match {
            continue;
        }
        if let Some(receipt) = read_receipt(&path)? {
            receipts.push(receipt);
        }
    }
    receipts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(receipts)
}
