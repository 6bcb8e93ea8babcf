use std::path::PathBuf;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: FarrierCommand,
}

#[derive(Debug, Args, Clone, PartialEq)]
pub struct GlobalArgs {
    /// Install prefix. Overrides the config file
    #[clap(long, global = true, env = "FARRIER_PREFIX")]
    pub prefix: Option<PathBuf>,
    /// Directory containing `<name>.toml` formulas
    #[clap(long, global = true, env = "FARRIER_FORMULA_DIR")]
    pub formula_dir: Option<PathBuf>,
    /// Path to `config.toml`
    #[clap(long, global = true, env = "FARRIER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Maximum number of formulas built in parallel
    #[clap(short, long, global = true)]
    pub jobs: Option<usize>,
    /// More log output (-v info, -vv debug)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum FarrierCommand {
    /// Builds a formula from source and installs it together with its missing dependencies
    Install {
        formula: String,
        /// Install only this formula, assuming its dependencies are present
        #[clap(long)]
        ignore_dependencies: bool,
        /// Run the formula's test block after installing
        #[clap(long)]
        test: bool,
    },
    /// Removes an installed formula and all files recorded in its receipt
    Uninstall {
        formula: String,
        /// Remove it even if other installed formulas depend on it
        #[clap(long)]
        ignore_dependencies: bool,
    },
    /// Runs the test block of an installed formula
    Test {
        formula: String,
    },
    /// Lists installed formulas
    List,
    /// Shows a formula and whether it is installed
    Info {
        formula: String,
    },
    /// Prints the install order for a formula
    Deps {
        formula: String,
    },
    /// Removes downloaded archives from the cache
    Clean,
}
