use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;
use crate::global::GlobalDirs;

/// Effective settings for one farrier invocation.
///
/// Built from defaults, then the config file, then CLI flags and their
/// environment variables, each layer overriding the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root directory installed files go under.
    pub prefix: PathBuf,
    /// Directory holding `<name>.toml` formula files.
    pub formula_dir: PathBuf,
    /// Archive cache directory.
    pub cache_dir: PathBuf,
    /// Maximum number of formulas built at the same time.
    pub jobs: usize,
    pub fetch_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Directories put on `PATH` for build steps, after dependency shims.
    pub build_path: Vec<PathBuf>,
    /// Variables copied from the caller's environment into build steps.
    pub passthrough_env: Vec<String>,
}

/// The on-disk config file. Every key is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    prefix: Option<PathBuf>,
    formula_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    jobs: Option<usize>,
    fetch_timeout_secs: Option<u64>,
    build_timeout_secs: Option<u64>,
    test_timeout_secs: Option<u64>,
    build_path: Option<Vec<PathBuf>>,
    passthrough_env: Option<Vec<String>>,
}

/// Values given on the command line (or via their env vars).
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub prefix: Option<PathBuf>,
    pub formula_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

impl Config {
    /// Built-in defaults rooted in the per-user directories.
    pub fn defaults(dirs: &GlobalDirs) -> Config {
        Config {
            prefix: dirs.prefix(),
            formula_dir: dirs.formula_dir(),
            cache_dir: dirs.archive_cache(),
            jobs: default_jobs(),
            fetch_timeout_secs: 300,
            build_timeout_secs: 3600,
            test_timeout_secs: 60,
            build_path: ["/usr/local/bin", "/usr/bin", "/bin"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            passthrough_env: ["HOME", "LANG", "TERM", "CARGO_HOME", "RUSTUP_HOME"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Loads the configuration.
    ///
    /// With an explicit `path` the file must exist. Without one,
    /// `<config_dir>/config.toml` is used if present.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains unknown keys.
    pub fn load(path: Option<&Path>, dirs: &GlobalDirs) -> Result<Config> {
        let mut config = Config::defaults(dirs);
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} not found", path.display());
                }
                Some(path.to_path_buf())
            }
            None => Some(dirs.config_file()).filter(|p| p.exists()),
        };
        if let Some(file) = file {
            debug!("reading config from {}", file.display());
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Could not read config file {}", file.display()))?;
            config.merge_str(&text)
                .with_context(|| format!("Invalid config file {}", file.display()))?;
        }
        Ok(config)
    }

    /// Applies the keys present in a TOML config document.
    pub fn merge_str(&mut self, text: &str) -> Result<()> {
        let file: ConfigFile = toml::from_str(text)?;
        if let Some(v) = file.prefix { self.prefix = v; }
        if let Some(v) = file.formula_dir { self.formula_dir = v; }
        if let Some(v) = file.cache_dir { self.cache_dir = v; }
        if let Some(v) = file.jobs { self.jobs = v; }
        if let Some(v) = file.fetch_timeout_secs { self.fetch_timeout_secs = v; }
        if let Some(v) = file.build_timeout_secs { self.build_timeout_secs = v; }
        if let Some(v) = file.test_timeout_secs { self.test_timeout_secs = v; }
        if let Some(v) = file.build_path { self.build_path = v; }
        if let Some(v) = file.passthrough_env { self.passthrough_env = v; }
        self.validate()
    }

    pub fn apply(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(prefix) = &overrides.prefix {
            self.prefix = prefix.clone();
        }
        if let Some(dir) = &overrides.formula_dir {
            self.formula_dir = dir.clone();
        }
        if let Some(jobs) = overrides.jobs {
            self.jobs = jobs;
        }
        self.validate()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.fetch_timeout_secs == 0 || self.build_timeout_secs == 0 || self.test_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        Ok(())
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dirs(root: &Path) -> GlobalDirs {
        GlobalDirs {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let root = tempdir().unwrap();
        let dirs = dirs(root.path());
        let config = Config::load(None, &dirs).unwrap();
        assert_eq!(config.prefix, root.path().join("data").join("prefix"));
        assert_eq!(config.formula_dir, root.path().join("data").join("Formula"));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(300));
        assert!(config.jobs >= 1);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let root = tempdir().unwrap();
        let dirs = dirs(root.path());
        std::fs::create_dir_all(&dirs.config_dir).unwrap();
        std::fs::write(
            dirs.config_file(),
            "prefix = \"/opt/farrier\"\njobs = 3\nbuild_timeout_secs = 10\n",
        )
        .unwrap();
        let config = Config::load(None, &dirs).unwrap();
        assert_eq!(config.prefix, PathBuf::from("/opt/farrier"));
        assert_eq!(config.jobs, 3);
        assert_eq!(config.build_timeout(), Duration::from_secs(10));
        assert_eq!(config.test_timeout_secs, 60);
    }

    #[test]
    fn test_overrides_win() {
        let root = tempdir().unwrap();
        let mut config = Config::defaults(&dirs(root.path()));
        config.merge_str("prefix = \"/opt/a\"").unwrap();
        config
            .apply(&Overrides {
                prefix: Some(PathBuf::from("/opt/b")),
                formula_dir: None,
                jobs: Some(2),
            })
            .unwrap();
        assert_eq!(config.prefix, PathBuf::from("/opt/b"));
        assert_eq!(config.jobs, 2);
    }

    #[test]
    fn test_rejects_unknown_keys_and_zero_jobs() {
        let root = tempdir().unwrap();
        let mut config = Config::defaults(&dirs(root.path()));
        assert!(config.merge_str("colour = true").is_err());
        assert!(config.merge_str("jobs = 0").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let root = tempdir().unwrap();
        let dirs = dirs(root.path());
        assert!(Config::load(Some(&root.path().join("nope.toml")), &dirs).is_err());
    }
}
