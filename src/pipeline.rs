//! Drives a full install: resolve, then fetch, build and install every
//! formula of the plan on a bounded pool of worker threads.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use anyhow::Context;
use tracing::{debug, info, warn};
use crate::builder::{Builder, StepLog};
use crate::config::Config;
use crate::error::{FarrierError, Result, Stage};
use crate::fetcher::{extract_archive, Fetcher};
use crate::formula::Formula;
use crate::formulary::FormulaLookup;
use crate::global::ArchiveCache;
use crate::installer::Installer;
use crate::receipt::InstallReceipt;
use crate::resolver::{dependencies_in, resolve_with};
use crate::shims::link_dependency_bins;
use crate::test_runner::{TestReport, TestRunner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Install only the target, assuming its dependencies are present.
    pub ignore_dependencies: bool,
    /// Run the target's test block once it is installed.
    pub run_tests: bool,
}

/// One formula that went through the whole pipeline.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub receipt: InstallReceipt,
    pub steps: Vec<StepLog>,
    pub duration: Duration,
}

/// Everything an install produced. `installed` is in completion order.
#[derive(Debug, Clone)]
pub struct InstallSummary {
    pub installed: Vec<InstallOutcome>,
    pub test_report: Option<TestReport>,
}

pub struct Pipeline<'a, L: FormulaLookup + ?Sized> {
    lookup: &'a L,
    fetcher: Fetcher,
    builder: Builder,
    installer: Installer,
    tester: TestRunner,
    jobs: usize,
}

impl<'a, L> Pipeline<'a, L>
where
    L: FormulaLookup + Sync + ?Sized,
{
    pub fn new(config: &Config, lookup: &'a L) -> anyhow::Result<Self> {
        let fetcher = Fetcher::new(ArchiveCache::new(&config.cache_dir), config.fetch_timeout())
            .context("Could not create HTTP client")?;
        Ok(Self {
            lookup,
            fetcher,
            builder: Builder::from_config(config),
            installer: Installer::new(&config.prefix),
            tester: TestRunner::new(&config.prefix, config.test_timeout()),
            jobs: config.jobs.max(1),
        })
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    /// The formulas `install` would process for `target`, in a valid order.
    ///
    /// Dependencies that already have a receipt are left out.
    pub fn plan(&self, target: &str, ignore_dependencies: bool) -> Result<Vec<&'a Formula>> {
        if ignore_dependencies {
            let formula = self.lookup.get(target).ok_or_else(|| FarrierError::NotFound {
                name: target.to_string(),
                required_by: None,
            })?;
            return Ok(vec![formula]);
        }
        let prefix = self.installer.prefix();
        resolve_with(target, self.lookup, |f| InstallReceipt::is_installed(prefix, &f.name))
    }

    /// Installs `target` and whatever it needs.
    ///
    /// # Errors
    ///
    /// The first error any job hit. Jobs already running are allowed to
    /// finish; nothing new is started after a failure. Formulas installed
    /// before the failure stay installed.
    pub fn install(&self, target: &str, options: InstallOptions) -> Result<InstallSummary> {
        let plan = self.plan(target, options.ignore_dependencies)?;
        info!(
            "install plan for {}: [{}]",
            target,
            plan.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        let installed = self.run_plan(&plan)?;

        let test_report = if options.run_tests {
            Some(self.test(target)?.into_result()?)
        } else {
            None
        };
        Ok(InstallSummary {
            installed,
            test_report,
        })
    }

    /// Runs the test block of an installed formula.
    pub fn test(&self, target: &str) -> Result<TestReport> {
        let formula = self.lookup.get(target).ok_or_else(|| FarrierError::NotFound {
            name: target.to_string(),
            required_by: None,
        })?;
        self.tester.run(formula)
    }

    /// Removes `target` from the prefix. With `ignore_dependencies` it is
    /// removed even if installed formulas still depend on it.
    pub fn uninstall(&self, target: &str, ignore_dependencies: bool) -> Result<InstallReceipt> {
        self.installer.uninstall(target, ignore_dependencies)
    }

    fn run_plan(&self, plan: &[&'a Formula]) -> Result<Vec<InstallOutcome>> {
        let names: BTreeSet<&str> = plan.iter().map(|f| f.name.as_str()).collect();
        let by_name: BTreeMap<&str, &'a Formula> = plan.iter().map(|f| (f.name.as_str(), *f)).collect();
        let mut waiting: BTreeMap<&str, BTreeSet<&str>> = plan
            .iter()
            .map(|f| (f.name.as_str(), dependencies_in(f, &names).into_iter().collect()))
            .collect();
        let mut ready: BTreeSet<&str> = BTreeSet::new();
        waiting.retain(|name, deps| {
            if deps.is_empty() {
                ready.insert(*name);
                false
            } else {
                true
            }
        });

        let mut outcomes = Vec::with_capacity(plan.len());
        let mut first_error: Option<FarrierError> = None;
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let mut running = 0usize;
            loop {
                while first_error.is_none() && running < self.jobs {
                    let Some(name) = ready.pop_first() else {
                        break;
                    };
                    let formula = by_name[name];
                    let tx = tx.clone();
                    running += 1;
                    debug!("starting job for {}", name);
                    scope.spawn(move || {
                        let result = self.install_one(formula);
                        let _ = tx.send((name, result));
                    });
                }
                if running == 0 {
                    break;
                }
                let Ok((name, result)) = rx.recv() else {
                    break;
                };
                running -= 1;
                match result {
                    Ok(outcome) => {
                        outcomes.push(outcome);
                        waiting.retain(|dependent, deps| {
                            deps.remove(name);
                            if deps.is_empty() {
                                ready.insert(*dependent);
                                false
                            } else {
                                true
                            }
                        });
                    }
                    Err(e) => {
                        warn!("{} failed: {}", name, e);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    fn install_one(&self, formula: &Formula) -> Result<InstallOutcome> {
        let started = Instant::now();
        let name = formula.name.as_str();
        let archive = self.fetcher.fetch(formula)?;

        let work = tempfile::Builder::new()
            .prefix(&format!("farrier-{name}-"))
            .tempdir()
            .map_err(FarrierError::io(name, Stage::Build, "creating build dir"))?;
        let source_dir = extract_archive(name, &archive, &work.path().join("src"))?;

        let shim_dir = work.path().join("shims");
        let dependencies = self.dependency_receipts(formula)?;
        link_dependency_bins(self.installer.prefix(), &dependencies, &shim_dir)
            .map_err(FarrierError::io(name, Stage::Build, "linking dependency binaries"))?;

        let out_dir = work.path().join("out");
        let steps = self.build(formula, &source_dir, &out_dir, &shim_dir)?;
        let receipt = self.installer.install(formula, &source_dir, &out_dir)?;
        Ok(InstallOutcome {
            receipt,
            steps,
            duration: started.elapsed(),
        })
    }

    fn build(&self, formula: &Formula, source_dir: &Path, out_dir: &Path, shim_dir: &Path) -> Result<Vec<StepLog>> {
        let steps = self.builder.build(formula, source_dir, out_dir, Some(shim_dir))?;
        for step in &steps {
            debug!("{}: `{}` took {:?}", formula.name, step.step, step.duration);
        }
        Ok(steps)
    }

    fn dependency_receipts(&self, formula: &Formula) -> Result<Vec<InstallReceipt>> {
        let mut receipts = Vec::new();
        for dep in &formula.dependencies {
            let receipt = InstallReceipt::load(self.installer.prefix(), &dep.name)
                .map_err(FarrierError::io(&formula.name, Stage::Build, format!("reading receipt of {}", dep.name)))?;
            match receipt {
                Some(receipt) => receipts.push(receipt),
                None => warn!("{}: dependency {} is not installed", formula.name, dep.name),
            }
        }
        Ok(receipts)
    }
}
