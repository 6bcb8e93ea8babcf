//! # Farrier Core Library
//!
//! This crate contains the core logic of `farrier`, a source-based package
//! manager. A package is described by a *formula*: a TOML file naming the
//! source archive, its checksum, dependencies, build steps, the files to
//! install and the checks that prove the install works.
//!
//! `farrier` builds every formula from source inside an isolated temporary
//! directory and copies the declared artifacts into a single prefix,
//! recording what it installed in a receipt.
//!
//! ## Modules Overview
//! - [`formula`] – Formula data model and TOML parsing
//! - [`formulary`] – Loading formula directories and name lookup
//! - [`resolver`] – Dependency closure, cycle detection and install order
//! - [`fetcher`] – Downloading, verifying and unpacking source archives
//! - [`builder`] – Running build steps with a constrained environment and timeouts
//! - [`installer`] – Copying artifacts into the prefix, receipts and uninstall
//! - [`test_runner`] – Checking a formula's test block against the prefix
//! - [`pipeline`] – Orchestrating all of the above on a bounded worker pool
//! - [`receipt`] – Install receipts stored in the prefix
//! - [`lock`] – Path locks serialising writes to shared prefix paths
//! - [`shims`] – Exposing dependency binaries to build steps
//! - [`config`] – Layered configuration
//! - [`error`] – The error type and the stage every failure belongs to
//! - [`util`] – Shared helpers (hashing, placeholders, prefix layout)
//! - [`global`] – Per-user directories and the archive cache

pub mod builder;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod formula;
pub mod formulary;
pub mod global;
pub mod installer;
pub mod lock;
pub mod pipeline;
pub mod receipt;
pub mod resolver;
pub mod shims;
pub mod test_runner;
pub mod util;

pub use builder::Builder;
pub use config::{Config, Overrides};
pub use error::{FarrierError, Stage};
pub use fetcher::Fetcher;
pub use formula::Formula;
pub use formulary::{FormulaLookup, Formulary};
pub use global::{ArchiveCache, GlobalDirs};
pub use installer::Installer;
pub use pipeline::{InstallOptions, InstallOutcome, InstallSummary, Pipeline};
pub use receipt::InstallReceipt;
pub use resolver::{resolve, resolve_with};
pub use test_runner::{TestReport, TestRunner};
