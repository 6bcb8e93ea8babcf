//! Runs a formula's build steps as constrained subprocesses.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use crate::config::Config;
use crate::error::{FarrierError, Result, Stage};
use crate::formula::{BuildStep, Formula};
use crate::util::expand_placeholders;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Result of a subprocess run by [`run_captured`].
#[derive(Debug)]
pub enum Captured {
    Exited {
        status: ExitStatus,
        /// stdout followed by stderr.
        output: String,
    },
    TimedOut,
}

/// Output of one successful build step.
#[derive(Debug, Clone)]
pub struct StepLog {
    pub step: String,
    pub output: String,
    pub duration: Duration,
}

/// Executes build steps inside an isolated source directory.
///
/// The environment of every step is rebuilt from scratch: `PATH` holds the
/// dependency shim directory (if any) followed by the configured base path,
/// plus the whitelisted passthrough variables. Nothing else leaks in from
/// the caller.
#[derive(Debug, Clone)]
pub struct Builder {
    base_path: Vec<PathBuf>,
    passthrough_env: Vec<String>,
    jobs: usize,
    timeout: Duration,
}

impl Builder {
    pub fn new(base_path: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            base_path,
            passthrough_env: Vec::new(),
            jobs: 1,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.build_path.clone(), config.build_timeout())
            .with_passthrough(config.passthrough_env.clone())
            .with_jobs(config.jobs)
    }

    pub fn with_passthrough(mut self, vars: Vec<String>) -> Self {
        self.passthrough_env = vars;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Runs every build step of `formula` in order.
    ///
    /// `out_dir` is exposed to the steps as `{out}` / `$FARRIER_OUT`;
    /// `shim_dir` is put first on `PATH`.
    ///
    /// # Errors
    ///
    /// * [`FarrierError::Build`] on the first step that exits nonzero or
    ///   cannot be started. Its output is reported verbatim; there are no retries.
    /// * [`FarrierError::Timeout`] if a step runs longer than the build timeout.
    pub fn build(
        &self,
        formula: &Formula,
        source_dir: &Path,
        out_dir: &Path,
        shim_dir: Option<&Path>,
    ) -> Result<Vec<StepLog>> {
        std::fs::create_dir_all(out_dir)
            .map_err(FarrierError::io(&formula.name, Stage::Build, "creating build output dir"))?;
        let vars = self.placeholders(formula, source_dir, out_dir);
        let path = self.search_path(shim_dir).map_err(|e| FarrierError::Build {
            formula: formula.name.clone(),
            step: "PATH".to_string(),
            exit_code: None,
            output: e.to_string(),
        })?;

        let mut logs = Vec::with_capacity(formula.build.len());
        for step in &formula.build {
            logs.push(self.run_step(formula, step, source_dir, out_dir, &path, &vars)?);
        }
        Ok(logs)
    }

    fn run_step(
        &self,
        formula: &Formula,
        step: &BuildStep,
        source_dir: &Path,
        out_dir: &Path,
        path: &OsString,
        vars: &BTreeMap<&str, String>,
    ) -> Result<StepLog> {
        let args: Vec<String> = step.args.iter().map(|a| expand_placeholders(a, vars)).collect();
        let shown = std::iter::once(step.command.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let workdir = match &step.workdir {
            Some(dir) => source_dir.join(expand_placeholders(dir, vars)),
            None => source_dir.to_path_buf(),
        };
        info!("{}: running `{}`", formula.name, shown);

        let mut cmd = Command::new(&step.command);
        cmd.args(&args).current_dir(&workdir).env_clear().env("PATH", path);
        for var in &self.passthrough_env {
            if let Some(value) = std::env::var_os(var) {
                cmd.env(var, value);
            }
        }
        cmd.env("FARRIER_SRC", source_dir)
            .env("FARRIER_OUT", out_dir)
            .env("FARRIER_JOBS", self.jobs.to_string());
        for (key, value) in &step.env {
            cmd.env(key, expand_placeholders(value, vars));
        }

        let started = Instant::now();
        let captured = run_captured(&mut cmd, self.timeout).map_err(|e| FarrierError::Build {
            formula: formula.name.clone(),
            step: shown.clone(),
            exit_code: None,
            output: format!("failed to start `{}`: {e}", step.command),
        })?;
        match captured {
            Captured::TimedOut => Err(FarrierError::Timeout {
                formula: formula.name.clone(),
                stage: Stage::Build,
                seconds: self.timeout.as_secs(),
            }),
            Captured::Exited { status, output } if status.success() => {
                debug!("{}: `{}` finished in {:?}", formula.name, shown, started.elapsed());
                Ok(StepLog {
                    step: shown,
                    output,
                    duration: started.elapsed(),
                })
            }
            Captured::Exited { status, output } => Err(FarrierError::Build {
                formula: formula.name.clone(),
                step: shown,
                exit_code: status.code(),
                output,
            }),
        }
    }

    fn placeholders(&self, formula: &Formula, source_dir: &Path, out_dir: &Path) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("src", source_dir.display().to_string());
        vars.insert("out", out_dir.display().to_string());
        vars.insert("name", formula.name.clone());
        vars.insert("version", formula.version.clone());
        vars.insert("jobs", self.jobs.to_string());
        vars
    }

    fn search_path(&self, shim_dir: Option<&Path>) -> Result<OsString, std::env::JoinPathsError> {
        let dirs = shim_dir
            .map(Path::to_path_buf)
            .into_iter()
            .chain(self.base_path.iter().cloned());
        std::env::join_paths(dirs)
    }
}

/// Spawns `cmd`, waits at most `timeout`, and collects stdout and stderr.
///
/// On timeout the child is killed. Output readers of a killed child are
/// left to finish on their own, since grandchildren may still hold the pipes.
pub fn run_captured(cmd: &mut Command, timeout: Duration) -> io::Result<Captured> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_all(stdout));
    let stderr_reader = thread::spawn(move || read_all(stderr));

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Captured::TimedOut);
        }
        thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
    };

    let mut output = stdout_reader.join().unwrap_or_default();
    output.push_str(&stderr_reader.join().unwrap_or_default());
    Ok(Captured::Exited { status, output })
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
