use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::error::{FarrierError, Result, Stage};
use crate::formula::{Artifact, Formula};
use crate::lock::PathLocks;
use crate::receipt::InstallReceipt;
use crate::util::{ensure_prefix_dirs, expand_placeholders, prune_empty_dirs, relative_files, set_executable};

/// One file to copy: absolute source, prefix-relative destination.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedFile {
    source: PathBuf,
    dest: PathBuf,
    executable: bool,
}

/// Copies build outputs into the prefix and keeps the receipts in order.
///
/// All writes for one formula happen while its destination paths are held in
/// the shared [`PathLocks`] table, so concurrent installs never interleave on
/// the same file.
#[derive(Debug)]
pub struct Installer {
    prefix: PathBuf,
    locks: PathLocks,
}

impl Installer {
    pub fn new<P: Into<PathBuf>>(prefix: P) -> Self {
        Self {
            prefix: prefix.into(),
            locks: PathLocks::new(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The receipt of `name`, if installed.
    pub fn receipt(&self, name: &str) -> Result<Option<InstallReceipt>> {
        InstallReceipt::load(&self.prefix, name)
            .map_err(FarrierError::io(name, Stage::Install, "reading receipt"))
    }

    /// Installs the artifacts of `formula` from a finished build.
    ///
    /// `source_dir` is the extracted source root, `out_dir` the build output
    /// directory (`{out}` in artifact paths).
    ///
    /// Reinstalling the same formula is allowed and overwrites its own files;
    /// a destination that exists but is not owned by this formula is rejected
    /// with [`FarrierError::Install`] before anything is copied.
    pub fn install(&self, formula: &Formula, source_dir: &Path, out_dir: &Path) -> Result<InstallReceipt> {
        let name = formula.name.as_str();
        let planned = self.plan(formula, source_dir, out_dir)?;
        ensure_prefix_dirs(&self.prefix)
            .map_err(FarrierError::io(name, Stage::Install, "creating prefix layout"))?;

        let _guard = self
            .locks
            .acquire(planned.iter().map(|f| self.prefix.join(&f.dest)));

        let previous = self.receipt(name)?;
        let pending = InstallReceipt::load_pending(&self.prefix, name)
            .map_err(FarrierError::io(name, Stage::Install, "reading pending receipt"))?;
        let owned: BTreeSet<PathBuf> = previous
            .iter()
            .chain(pending.iter())
            .flat_map(|r| r.files.iter().cloned())
            .collect();
        self.check_collisions(name, &planned, &owned)?;

        let new_files: Vec<PathBuf> = planned.iter().map(|f| f.dest.clone()).collect();
        let mut journal: Vec<PathBuf> = owned.iter().cloned().collect();
        journal.extend(new_files.iter().cloned());
        InstallReceipt::new(formula, journal)
            .save_pending(&self.prefix)
            .map_err(FarrierError::io(name, Stage::Install, "writing pending receipt"))?;

        for file in &planned {
            self.copy_file(name, file)?;
        }

        let keep: BTreeSet<&PathBuf> = new_files.iter().collect();
        let foreign = self.claimed_by_others(name, Stage::Install)?;
        for stale in owned.iter().filter(|f| !keep.contains(f) && !foreign.contains_key(*f)) {
            debug!("{}: removing stale {}", name, stale.display());
            self.remove_file(name, stale, Stage::Install)?;
        }

        let receipt = InstallReceipt::new(formula, new_files);
        receipt
            .save(&self.prefix)
            .map_err(FarrierError::io(name, Stage::Install, "writing receipt"))?;
        info!("{}: installed {} files into {}", name, receipt.files.len(), self.prefix.display());
        Ok(receipt)
    }

    /// Removes every file recorded for `name` and its receipt.
    ///
    /// Unless `force` is set, refuses while another installed formula lists
    /// `name` as a runtime dependency. An interrupted install (pending
    /// receipt only) is cleaned up the same way.
    pub fn uninstall(&self, name: &str, force: bool) -> Result<InstallReceipt> {
        let io_err = |context: &str| FarrierError::io(name, Stage::Uninstall, context.to_string());
        let receipt = match InstallReceipt::load(&self.prefix, name).map_err(io_err("reading receipt"))? {
            Some(receipt) => receipt,
            None => InstallReceipt::load_pending(&self.prefix, name)
                .map_err(io_err("reading pending receipt"))?
                .ok_or_else(|| FarrierError::NotInstalled {
                    formula: name.to_string(),
                    stage: Stage::Uninstall,
                })?,
        };

        if !force {
            let dependents: Vec<String> = InstallReceipt::all(&self.prefix)
                .map_err(io_err("reading receipts"))?
                .into_iter()
                .filter(|r| r.name != name && r.runtime_dependencies.iter().any(|d| d == name))
                .map(|r| r.name)
                .collect();
            if !dependents.is_empty() {
                return Err(FarrierError::InUse {
                    formula: name.to_string(),
                    dependents,
                });
            }
        }

        let _guard = self
            .locks
            .acquire(receipt.files.iter().map(|f| self.prefix.join(f)));
        let foreign = self.claimed_by_others(name, Stage::Uninstall)?;
        for file in &receipt.files {
            if let Some(owner) = foreign.get(file) {
                warn!("{}: leaving {}, it belongs to '{}'", name, file.display(), owner);
                continue;
            }
            self.remove_file(name, file, Stage::Uninstall)?;
        }
        InstallReceipt::remove(&self.prefix, name).map_err(io_err("removing receipt"))?;
        info!("{}: removed {} files", name, receipt.files.len());
        Ok(receipt)
    }

    fn plan(&self, formula: &Formula, source_dir: &Path, out_dir: &Path) -> Result<Vec<PlannedFile>> {
        let mut vars = BTreeMap::new();
        vars.insert("src", source_dir.display().to_string());
        vars.insert("out", out_dir.display().to_string());
        vars.insert("name", formula.name.clone());
        vars.insert("version", formula.version.clone());

        let mut planned = Vec::new();
        let mut seen = BTreeSet::new();
        for artifact in &formula.artifacts {
            let source = source_dir.join(expand_placeholders(&artifact.path, &vars));
            for file in self.plan_artifact(formula, artifact, &source)? {
                if !seen.insert(file.dest.clone()) {
                    return Err(install_error(
                        formula,
                        &file.dest,
                        "declared by more than one artifact",
                    ));
                }
                planned.push(file);
            }
        }
        Ok(planned)
    }

    fn plan_artifact(&self, formula: &Formula, artifact: &Artifact, source: &Path) -> Result<Vec<PlannedFile>> {
        let file_name = artifact.file_name().unwrap_or_default();
        let dest_dir = Path::new(artifact.kind.subdir());
        let executable = artifact.kind.is_executable();

        if source.is_dir() {
            let files = relative_files(source)
                .map_err(FarrierError::io(&formula.name, Stage::Install, format!("listing {}", source.display())))?;
            return Ok(files
                .into_iter()
                .map(|rel| PlannedFile {
                    source: source.join(&rel),
                    dest: dest_dir.join(&file_name).join(rel),
                    executable,
                })
                .collect());
        }
        if !source.is_file() {
            return Err(install_error(formula, source, "artifact was not produced by the build"));
        }
        Ok(vec![PlannedFile {
            source: source.to_path_buf(),
            dest: dest_dir.join(file_name),
            executable,
        }])
    }

    /// Files listed by the complete or pending receipt of any formula other
    /// than `name`, mapped to that formula.
    fn claimed_by_others(&self, name: &str, stage: Stage) -> Result<BTreeMap<PathBuf, String>> {
        let complete = InstallReceipt::all(&self.prefix)
            .map_err(FarrierError::io(name, stage, "reading receipts"))?;
        let pending = InstallReceipt::all_pending(&self.prefix)
            .map_err(FarrierError::io(name, stage, "reading pending receipts"))?;
        let mut others = BTreeMap::new();
        // Complete receipts go last so they win over a stale pending claim.
        for receipt in pending.into_iter().chain(complete).filter(|r| r.name != name) {
            for file in receipt.files {
                others.insert(file, receipt.name.clone());
            }
        }
        Ok(others)
    }

    fn check_collisions(&self, name: &str, planned: &[PlannedFile], owned: &BTreeSet<PathBuf>) -> Result<()> {
        let others = self.claimed_by_others(name, Stage::Install)?;
        for file in planned {
            if let Some(owner) = others.get(&file.dest) {
                return Err(FarrierError::Install {
                    formula: name.to_string(),
                    path: file.dest.clone(),
                    reason: format!("already installed by '{owner}'"),
                });
            }
            let exists = self.prefix.join(&file.dest).symlink_metadata().is_ok();
            if exists && !owned.contains(&file.dest) {
                return Err(FarrierError::Install {
                    formula: name.to_string(),
                    path: file.dest.clone(),
                    reason: "exists and is not owned by this formula".to_string(),
                });
            }
        }
        Ok(())
    }

    fn copy_file(&self, name: &str, file: &PlannedFile) -> Result<()> {
        let dest = self.prefix.join(&file.dest);
        let io_err = |context: &str| FarrierError::io(name, Stage::Install, format!("{context} {}", dest.display()));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err("creating directory for"))?;
        }
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest).map_err(io_err("replacing"))?;
        }
        fs::copy(&file.source, &dest).map_err(io_err("copying"))?;
        if file.executable {
            set_executable(&dest).map_err(io_err("setting permissions on"))?;
        }
        debug!("{}: installed {}", name, file.dest.display());
        Ok(())
    }

    fn remove_file(&self, name: &str, rel: &Path, stage: Stage) -> Result<()> {
        let path = self.prefix.join(rel);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{}: {} was already gone", name, rel.display());
            }
            Err(e) => {
                return Err(FarrierError::io(name, stage, format!("removing {}", path.display()))(e));
            }
        }
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.prefix);
        }
        Ok(())
    }
}

fn install_error(formula: &Formula, path: &Path, reason: &str) -> FarrierError {
    FarrierError::Install {
        formula: formula.name.clone(),
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
