//! Evaluates a formula's `test` block against the installed prefix.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};
use crate::builder::{run_captured, Captured};
use crate::error::{FarrierError, Result, Stage};
use crate::formula::{Formula, TestAssertion};
use crate::receipt::InstallReceipt;
use crate::util::is_executable;

/// Outcome of a single assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionResult {
    pub description: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Outcome of a whole test block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub formula: String,
    pub results: Vec<AssertionResult>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| match &r.detail {
                Some(detail) => format!("{}: {detail}", r.description),
                None => r.description.clone(),
            })
            .collect()
    }

    /// Turns a failed report into [`FarrierError::Test`].
    pub fn into_result(self) -> Result<TestReport> {
        if self.passed() {
            Ok(self)
        } else {
            Err(FarrierError::Test {
                failures: self.failures(),
                formula: self.formula,
            })
        }
    }
}

/// Runs test assertions. It only reads from the prefix; commands run in a
/// throwaway directory.
#[derive(Debug, Clone)]
pub struct TestRunner {
    prefix: PathBuf,
    timeout: Duration,
}

impl TestRunner {
    pub fn new<P: Into<PathBuf>>(prefix: P, timeout: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            timeout,
        }
    }

    /// Checks every assertion of `formula` and reports each result.
    ///
    /// # Errors
    ///
    /// [`FarrierError::NotInstalled`] if `formula` has no receipt. Failing
    /// assertions are not errors here; see [`TestReport::into_result`].
    pub fn run(&self, formula: &Formula) -> Result<TestReport> {
        if !InstallReceipt::is_installed(&self.prefix, &formula.name) {
            return Err(FarrierError::NotInstalled {
                formula: formula.name.clone(),
                stage: Stage::Test,
            });
        }
        if formula.test.is_empty() {
            warn!("{}: formula has no test block", formula.name);
        }

        let scratch = tempfile::tempdir()
            .map_err(FarrierError::io(&formula.name, Stage::Test, "creating scratch dir"))?;
        let results = formula
            .test
            .iter()
            .map(|assertion| self.check(assertion, scratch.path()))
            .collect();
        let report = TestReport {
            formula: formula.name.clone(),
            results,
        };
        info!(
            "{}: {} of {} assertions passed",
            formula.name,
            report.results.iter().filter(|r| r.passed).count(),
            report.results.len()
        );
        Ok(report)
    }

    fn check(&self, assertion: &TestAssertion, scratch: &Path) -> AssertionResult {
        let description = assertion.to_string();
        let outcome = match assertion {
            TestAssertion::Exists { path } => {
                if self.prefix.join(path).symlink_metadata().is_ok() {
                    Ok(())
                } else {
                    Err("not found".to_string())
                }
            }
            TestAssertion::Executable { path } => {
                let path = self.prefix.join(path);
                if is_executable(&path) {
                    Ok(())
                } else if path.exists() {
                    Err("not executable".to_string())
                } else {
                    Err("not found".to_string())
                }
            }
            TestAssertion::Run {
                command,
                args,
                exit_code,
                output_contains,
            } => self.check_run(command, args, *exit_code, output_contains.as_deref(), scratch),
        };
        match outcome {
            Ok(()) => AssertionResult {
                description,
                passed: true,
                detail: None,
            },
            Err(detail) => AssertionResult {
                description,
                passed: false,
                detail: Some(detail),
            },
        }
    }

    fn check_run(
        &self,
        command: &str,
        args: &[String],
        expected_code: i32,
        output_contains: Option<&str>,
        scratch: &Path,
    ) -> std::result::Result<(), String> {
        let bin_dir = self.prefix.join("bin");
        let program = if command.contains('/') {
            self.prefix.join(command)
        } else if bin_dir.join(command).exists() {
            bin_dir.join(command)
        } else {
            PathBuf::from(command)
        };
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(bin_dir.clone()).chain(std::env::split_paths(&inherited));
        let path = std::env::join_paths(dirs).map_err(|e| format!("cannot build PATH: {e}"))?;

        let mut cmd = Command::new(&program);
        cmd.args(args).current_dir(scratch).env("PATH", path);
        match run_captured(&mut cmd, self.timeout) {
            Err(e) => Err(format!("cannot run {}: {e}", program.display())),
            Ok(Captured::TimedOut) => Err(format!("timed out after {:?}", self.timeout)),
            Ok(Captured::Exited { status, output }) => {
                if status.code() != Some(expected_code) {
                    return Err(format!(
                        "exited with {}",
                        status.code().map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_string())
                    ));
                }
                match output_contains {
                    Some(needle) if !output.contains(needle) => {
                        Err(format!("output does not contain {needle:?}"))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}
