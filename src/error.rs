use std::fmt;
use std::io;
use std::path::PathBuf;

/// The pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Fetch,
    Build,
    Install,
    Test,
    Uninstall,
}

impl Stage {
    /// Process exit code used by the CLI for failures in this stage.
    pub fn exit_code(self) -> u8 {
        match self {
            Stage::Resolve => 2,
            Stage::Fetch => 3,
            Stage::Build => 4,
            Stage::Install => 5,
            Stage::Test => 6,
            Stage::Uninstall => 7,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Build => "build",
            Stage::Install => "install",
            Stage::Test => "test",
            Stage::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

/// Every failure `farrier` can report. Each variant knows which formula and
/// which [`Stage`] it belongs to.
#[derive(Debug, thiserror::Error)]
pub enum FarrierError {
    #[error("formula '{name}' not found{}", required_by.as_ref().map(|r| format!(" (required by '{r}')")).unwrap_or_default())]
    NotFound {
        name: String,
        required_by: Option<String>,
    },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    #[error("checksum mismatch for '{formula}' ({url}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        formula: String,
        url: String,
        expected: String,
        actual: String,
    },

    #[error("failed to fetch '{formula}' from {url}: {reason}")]
    Fetch {
        formula: String,
        url: String,
        reason: String,
    },

    #[error("build of '{formula}' failed at `{step}` ({}):\n{output}", exit_code.map(|c| format!("exit code {c}")).unwrap_or_else(|| "no exit code".to_string()))]
    Build {
        formula: String,
        step: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("cannot install '{formula}': {path}: {reason}")]
    Install {
        formula: String,
        path: PathBuf,
        reason: String,
    },

    #[error("{stage} of '{formula}' timed out after {seconds}s")]
    Timeout {
        formula: String,
        stage: Stage,
        seconds: u64,
    },

    #[error("test of '{formula}' failed: {}", failures.join("; "))]
    Test {
        formula: String,
        failures: Vec<String>,
    },

    #[error("formula '{formula}' is not installed")]
    NotInstalled { formula: String, stage: Stage },

    #[error("refusing to uninstall '{formula}': required by {}", dependents.join(", "))]
    InUse {
        formula: String,
        dependents: Vec<String>,
    },

    #[error("{stage} of '{formula}': {context}")]
    Io {
        formula: String,
        stage: Stage,
        context: String,
        #[source]
        source: io::Error,
    },
}

impl FarrierError {
    /// Builds a `map_err` adapter that wraps an [`io::Error`] with context.
    pub fn io(
        formula: &str,
        stage: Stage,
        context: impl Into<String>,
    ) -> impl FnOnce(io::Error) -> FarrierError {
        let formula = formula.to_string();
        let context = context.into();
        move |source| FarrierError::Io {
            formula,
            stage,
            context,
            source,
        }
    }

    /// The formula the failure is attributed to.
    pub fn formula(&self) -> &str {
        match self {
            FarrierError::NotFound { name, .. } => name,
            FarrierError::Cycle { cycle } => cycle.first().map(String::as_str).unwrap_or(""),
            FarrierError::InvalidFormula { formula, .. }
            | FarrierError::ChecksumMismatch { formula, .. }
            | FarrierError::Fetch { formula, .. }
            | FarrierError::Build { formula, .. }
            | FarrierError::Install { formula, .. }
            | FarrierError::Timeout { formula, .. }
            | FarrierError::Test { formula, .. }
            | FarrierError::NotInstalled { formula, .. }
            | FarrierError::InUse { formula, .. }
            | FarrierError::Io { formula, .. } => formula,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            FarrierError::NotFound { .. }
            | FarrierError::Cycle { .. }
            | FarrierError::InvalidFormula { .. } => Stage::Resolve,
            FarrierError::ChecksumMismatch { .. } | FarrierError::Fetch { .. } => Stage::Fetch,
            FarrierError::Build { .. } => Stage::Build,
            FarrierError::Install { .. } => Stage::Install,
            FarrierError::Test { .. } => Stage::Test,
            FarrierError::InUse { .. } => Stage::Uninstall,
            FarrierError::Timeout { stage, .. }
            | FarrierError::NotInstalled { stage, .. }
            | FarrierError::Io { stage, .. } => *stage,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.stage().exit_code()
    }
}

pub type Result<T, E = FarrierError> = std::result::Result<T, E>;
