use std::io;
use std::path::Path;
use tracing::debug;
use crate::receipt::InstallReceipt;

/// Creates a platform-specific "shim" forwarding execution to a target binary.
///
/// On Unix systems, this creates a symbolic link (`symlink`) at `shim_path` pointing to `target`.
/// On Windows, it creates a `.bat` script at `shim_path` (with a `.bat` extension) that calls the `target`.
///
/// # Errors
///
/// Returns an error if the symlink (on Unix) or file write (on Windows) fails.
pub fn create_shim<P: AsRef<Path>, Q: AsRef<Path>>(target: P, shim_path: Q) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, shim_path)?;
    }
    #[cfg(windows)]
    {
        let script = format!(
            "@echo off\r\ncall \"{}\" %*\r\n",
            target.as_ref().display()
        );
        std::fs::write(shim_path.as_ref().with_extension("bat"), script)?;
    }
    Ok(())
}

/// Exposes the installed binaries of `dependencies` in `shim_dir`.
///
/// Build steps get `shim_dir` at the front of their `PATH`, so only the
/// binaries of formulas that were actually declared as dependencies are
/// reachable from the prefix. Returns the number of shims created.
pub fn link_dependency_bins(
    prefix: &Path,
    dependencies: &[InstallReceipt],
    shim_dir: &Path,
) -> io::Result<usize> {
    std::fs::create_dir_all(shim_dir)?;
    let mut created = 0;
    for receipt in dependencies {
        for file in &receipt.files {
            let is_bin = file.parent().is_some_and(|p| p == Path::new("bin") || p == Path::new("sbin"));
            let Some(file_name) = file.file_name() else {
                continue;
            };
            if !is_bin || shim_dir.join(file_name).symlink_metadata().is_ok() {
                continue;
            }
            create_shim(prefix.join(file), shim_dir.join(file_name))?;
            debug!("shim {} -> {}", file_name.to_string_lossy(), receipt.name);
            created += 1;
        }
    }
    Ok(created)
}
