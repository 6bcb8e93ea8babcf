use anyhow::{Context, Result};
use colored::Colorize;
use farrier::config::{Config, Overrides};
use farrier::error::FarrierError;
use farrier::formula::DependencyKind;
use farrier::formulary::{FormulaLookup, Formulary};
use farrier::global::{ArchiveCache, GlobalDirs};
use farrier::installer::Installer;
use farrier::pipeline::{InstallOptions, Pipeline};
use farrier::receipt::InstallReceipt;
use farrier::resolver::resolve;
use farrier::test_runner::{TestReport, TestRunner};
use crate::cli::{FarrierCommand, GlobalArgs, CLI};

pub fn execute(cli: CLI) -> Result<()> {
    let config = load_config(&cli.global)?;
    match cli.command {
        FarrierCommand::Install { formula, ignore_dependencies, test } => {
            execute_install(&config, &formula, InstallOptions { ignore_dependencies, run_tests: test })
        }
        FarrierCommand::Uninstall { formula, ignore_dependencies } => {
            execute_uninstall(&config, &formula, ignore_dependencies)
        }
        FarrierCommand::Test { formula } => {
            execute_test(&config, &formula)
        }
        FarrierCommand::List => {
            execute_list(&config)
        }
        FarrierCommand::Info { formula } => {
            execute_info(&config, &formula)
        }
        FarrierCommand::Deps { formula } => {
            execute_deps(&config, &formula)
        }
        FarrierCommand::Clean => {
            execute_clean(&config)
        }
    }
}

fn load_config(global: &GlobalArgs) -> Result<Config> {
    let dirs = GlobalDirs::discover()?;
    let mut config = Config::load(global.config.as_deref(), &dirs)?;
    config.apply(&Overrides {
        prefix: global.prefix.clone(),
        formula_dir: global.formula_dir.clone(),
        jobs: global.jobs,
    })?;
    Ok(config)
}

fn load_formulary(config: &Config) -> Result<Formulary> {
    let formulary = Formulary::load_dir(&config.formula_dir)
        .with_context(|| format!("Could not load formulas from {}", config.formula_dir.display()))?;
    Ok(formulary)
}

pub fn execute_install(config: &Config, name: &str, options: InstallOptions) -> Result<()> {
    let formulary = load_formulary(config)?;
    let pipeline = Pipeline::new(config, &formulary)?;
    let summary = pipeline.install(name, options)?;

    for outcome in &summary.installed {
        let receipt = &outcome.receipt;
        println!(
            "{} {} {} ({} files, {:.1}s)",
            "==>".green().bold(),
            receipt.name.bold(),
            receipt.version,
            receipt.files.len(),
            outcome.duration.as_secs_f64()
        );
    }
    if let Some(report) = &summary.test_report {
        print_report(report);
    }
    println!("Installed {} into {}", name.bold(), config.prefix.display());
    Ok(())
}

pub fn execute_uninstall(config: &Config, name: &str, ignore_dependencies: bool) -> Result<()> {
    let installer = Installer::new(&config.prefix);
    let receipt = installer.uninstall(name, ignore_dependencies)?;
    println!(
        "Uninstalled {} {} ({} files removed)",
        receipt.name.bold(),
        receipt.version,
        receipt.files.len()
    );
    Ok(())
}

pub fn execute_test(config: &Config, name: &str) -> Result<()> {
    let formulary = load_formulary(config)?;
    let formula = formulary.get(name).ok_or_else(|| FarrierError::NotFound {
        name: name.to_string(),
        required_by: None,
    })?;
    let report = TestRunner::new(&config.prefix, config.test_timeout()).run(formula)?;
    print_report(&report);
    report.into_result()?;
    Ok(())
}

fn print_report(report: &TestReport) {
    for result in &report.results {
        let mark = if result.passed { "ok".green() } else { "FAILED".red() };
        match &result.detail {
            Some(detail) => println!("  {} {} ({})", mark, result.description, detail),
            None => println!("  {} {}", mark, result.description),
        }
    }
    let passed = report.results.iter().filter(|r| r.passed).count();
    println!("{}: {}/{} assertions passed", report.formula.bold(), passed, report.results.len());
}

pub fn execute_list(config: &Config) -> Result<()> {
    let receipts = InstallReceipt::all(&config.prefix)
        .context("Could not read install receipts")?;
    let pending = InstallReceipt::all_pending(&config.prefix)
        .context("Could not read pending install receipts")?;

    if receipts.is_empty() && pending.is_empty() {
        println!("No formulas installed");
        return Ok(());
    }
    for receipt in &receipts {
        println!("{} {}", receipt.name.bold(), receipt.version);
    }
    for receipt in pending.iter().filter(|p| !receipts.iter().any(|r| r.name == p.name)) {
        println!("{} {} {}", receipt.name.bold(), receipt.version, "(incomplete)".yellow());
    }
    Ok(())
}

pub fn execute_info(config: &Config, name: &str) -> Result<()> {
    let formulary = load_formulary(config)?;
    let formula = formulary.get(name).ok_or_else(|| FarrierError::NotFound {
        name: name.to_string(),
        required_by: None,
    })?;

    println!("{} {}", formula.name.bold(), formula.version);
    if !formula.desc.is_empty() {
        println!("{}", formula.desc);
    }
    if !formula.homepage.is_empty() {
        println!("{}", formula.homepage);
    }
    if let Some(license) = &formula.license {
        println!("License: {license}");
    }
    println!("From: {}", formula.url);
    println!("sha256: {}", formula.sha256);
    if !formula.dependencies.is_empty() {
        println!("Dependencies:");
        for dep in &formula.dependencies {
            let kind = match dep.kind {
                DependencyKind::Build => " (build)",
                DependencyKind::Runtime => "",
            };
            let mark = if InstallReceipt::is_installed(&config.prefix, &dep.name) {
                "✔".green()
            } else {
                "✘".red()
            };
            println!("  {} {}{}", mark, dep.name, kind);
        }
    }

    let installer = Installer::new(&config.prefix);
    match installer.receipt(name)? {
        Some(receipt) => {
            println!(
                "Installed: {} ({} files, {})",
                receipt.version,
                receipt.files.len(),
                receipt.installed_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None => println!("Not installed"),
    }
    Ok(())
}

pub fn execute_deps(config: &Config, name: &str) -> Result<()> {
    let formulary = load_formulary(config)?;
    let order = resolve(name, &formulary)?;
    for formula in order {
        let installed = InstallReceipt::is_installed(&config.prefix, &formula.name);
        if installed {
            println!("{} {}", formula.name, "(installed)".dimmed());
        } else {
            println!("{}", formula.name);
        }
    }
    Ok(())
}

pub fn execute_clean(config: &Config) -> Result<()> {
    let cache = ArchiveCache::new(&config.cache_dir);
    let stats = cache
        .clean_cache()
        .with_context(|| format!("Could not clean {}", config.cache_dir.display()))?;
    println!("Removed {} archives ({} bytes)", stats.files, stats.bytes);
    Ok(())
}
