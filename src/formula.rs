use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::error::{FarrierError, Result};
use crate::util::{file_name_from_url, normalize_sha256};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._+-]*$").expect("valid regex"));

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[-_])v?(\d+(?:\.\d+)+)$").expect("valid regex"));

const ARCHIVE_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz", ".tar.xz", ".tar.bz2", ".tar", ".zip"];

/// A declarative package description, loaded from `<name>.toml`.
///
/// A formula says where the source lives, which other formulas it needs,
/// how to build it, which files end up in the prefix and how to check the
/// result. It is never modified after [`Formula::parse`] returns.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Formula {
    /// Unique formula name, also the file stem of its definition.
    pub name: String,
    /// Version string. Inferred from the source URL when left out.
    #[serde(default)]
    pub version: String,
    /// One-line description.
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub homepage: String,
    /// Source archive location (`https://`, `file://` or a local path).
    pub url: String,
    /// Expected SHA-256 of the source archive, hex encoded.
    pub sha256: String,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Ordered build steps, run inside the extracted source directory.
    #[serde(default)]
    pub build: Vec<BuildStep>,
    /// Files copied into the prefix once the build succeeded.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Assertions checked by `farrier test`.
    #[serde(default)]
    pub test: Vec<TestAssertion>,
}

/// A reference to another formula.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub kind: DependencyKind,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building.
    Build,
    /// Needed by the installed result.
    #[default]
    Runtime,
}

/// One subprocess invocation of the build.
///
/// Arguments, environment values and `workdir` may contain the placeholders
/// `{src}`, `{out}`, `{name}`, `{version}` and `{jobs}`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the source root.
    #[serde(default)]
    pub workdir: Option<String>,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Where in the prefix an artifact goes.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Bin,
    Sbin,
    Lib,
    Libexec,
    Include,
    Share,
    Etc,
    Man1,
    Man2,
    Man3,
    Man4,
    Man5,
    Man6,
    Man7,
    Man8,
}

impl ArtifactKind {
    /// Prefix-relative directory for this kind.
    pub fn subdir(self) -> &'static str {
        match self {
            ArtifactKind::Bin => "bin",
            ArtifactKind::Sbin => "sbin",
            ArtifactKind::Lib => "lib",
            ArtifactKind::Libexec => "libexec",
            ArtifactKind::Include => "include",
            ArtifactKind::Share => "share",
            ArtifactKind::Etc => "etc",
            ArtifactKind::Man1 => "share/man/man1",
            ArtifactKind::Man2 => "share/man/man2",
            ArtifactKind::Man3 => "share/man/man3",
            ArtifactKind::Man4 => "share/man/man4",
            ArtifactKind::Man5 => "share/man/man5",
            ArtifactKind::Man6 => "share/man/man6",
            ArtifactKind::Man7 => "share/man/man7",
            ArtifactKind::Man8 => "share/man/man8",
        }
    }

    /// Whether installed files of this kind get the executable bit.
    pub fn is_executable(self) -> bool {
        matches!(self, ArtifactKind::Bin | ArtifactKind::Sbin | ArtifactKind::Libexec)
    }
}

/// A build output to copy into the prefix.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Source path relative to the source root, placeholders allowed.
    pub path: String,
    /// Destination file name. Defaults to the last component of `path`.
    #[serde(default)]
    pub name: Option<String>,
}

impl Artifact {
    pub fn file_name(&self) -> Option<String> {
        match &self.name {
            Some(name) => Some(name.clone()),
            None => Path::new(&self.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string()),
        }
    }
}

/// A check run against the installed prefix. Paths are prefix-relative.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    Exists {
        path: String,
    },
    Executable {
        path: String,
    },
    Run {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        exit_code: i32,
        #[serde(default)]
        output_contains: Option<String>,
    },
}

impl fmt::Display for TestAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestAssertion::Exists { path } => write!(f, "{path} exists"),
            TestAssertion::Executable { path } => write!(f, "{path} is executable"),
            TestAssertion::Run { command, args, exit_code, .. } => {
                write!(f, "`{command}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                write!(f, "` exits with {exit_code}")
            }
        }
    }
}

impl Formula {
    /// Parses and validates a formula definition.
    ///
    /// # Arguments
    /// * `name_hint` - Name used in errors, usually the file stem.
    /// * `text` - TOML source.
    ///
    /// # Errors
    /// Returns [`FarrierError::InvalidFormula`] for malformed TOML or values
    /// that fail validation.
    pub fn parse(name_hint: &str, text: &str) -> Result<Formula> {
        let mut formula: Formula = toml::from_str(text).map_err(|e| invalid(name_hint, e.to_string()))?;
        formula.normalize()?;
        Ok(formula)
    }

    /// Loads a formula from `<dir>/<name>.toml`. The `name` key must match
    /// the file stem.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Formula> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(&stem, format!("cannot read {}: {e}", path.display())))?;
        let formula = Formula::parse(&stem, &text)?;
        if formula.name != stem {
            return Err(invalid(
                &stem,
                format!("name '{}' does not match file name {}", formula.name, path.display()),
            ));
        }
        Ok(formula)
    }

    /// Names of all declared dependencies, in declaration order.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }

    pub fn runtime_dependencies(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Runtime)
            .map(|d| d.name.clone())
            .collect()
    }

    fn normalize(&mut self) -> Result<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(invalid(&self.name, "name must match [a-z0-9][a-z0-9._+-]*"));
        }
        if self.url.trim().is_empty() {
            return Err(invalid(&self.name, "url is empty"));
        }
        self.sha256 = normalize_sha256(&self.sha256)
            .ok_or_else(|| invalid(&self.name, "sha256 must be 64 hex digits"))?;
        if self.version.is_empty() {
            self.version = infer_version(&self.url)
                .ok_or_else(|| invalid(&self.name, "no version given and none found in url"))?;
        }
        for dep in &self.dependencies {
            if !NAME_RE.is_match(&dep.name) {
                return Err(invalid(&self.name, format!("invalid dependency name '{}'", dep.name)));
            }
        }
        for artifact in &self.artifacts {
            match artifact.file_name() {
                Some(name) if !name.contains('/') && name != ".." => {}
                _ => {
                    return Err(invalid(
                        &self.name,
                        format!("artifact '{}' has no usable file name", artifact.path),
                    ));
                }
            }
        }
        for assertion in &self.test {
            match assertion {
                TestAssertion::Exists { path } | TestAssertion::Executable { path } => {
                    if !is_contained(path) {
                        return Err(invalid(&self.name, format!("test path '{path}' leaves the prefix")));
                    }
                }
                TestAssertion::Run { command, .. } => {
                    if command.contains('/') && !is_contained(command) {
                        return Err(invalid(&self.name, format!("test command '{command}' leaves the prefix")));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Guesses a version from the archive file name of `url`.
pub fn infer_version(url: &str) -> Option<String> {
    let file = file_name_from_url(url)?;
    let stem = ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|ext| file.strip_suffix(ext))
        .unwrap_or(&file);
    VERSION_RE
        .captures(stem)
        .map(|caps| caps[1].to_string())
}

fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
}

fn invalid(formula: &str, reason: impl Into<String>) -> FarrierError {
    FarrierError::InvalidFormula {
        formula: formula.to_string(),
        reason: reason.into(),
    }
}
