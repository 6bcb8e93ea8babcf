use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;

/// Per-user directories farrier falls back to when nothing is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDirs {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl GlobalDirs {
    pub fn discover() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("org", "farrier", "farrier")
            .ok_or_else(|| anyhow!("Could not get project directories"))?;
        Ok(Self {
            config_dir: proj_dirs.config_dir().to_path_buf(),
            cache_dir: proj_dirs.cache_dir().to_path_buf(),
            data_dir: proj_dirs.data_dir().to_path_buf(),
        })
    }

    /// `config.toml` inside the config directory.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Default install prefix.
    pub fn prefix(&self) -> PathBuf {
        self.data_dir.join("prefix")
    }

    /// Default formula directory.
    pub fn formula_dir(&self) -> PathBuf {
        self.data_dir.join("Formula")
    }

    /// Verified source archives.
    pub fn archive_cache(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }
}
