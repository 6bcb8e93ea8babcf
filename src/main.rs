mod cli;
mod execute;

use std::process::ExitCode;
use clap::Parser;
use colored::Colorize;
use farrier::FarrierError;
use tracing_subscriber::EnvFilter;
use crate::cli::CLI;

fn main() -> ExitCode {
    let cli = CLI::parse();
    init_logging(cli.global.verbose);

    match execute::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            let code = e
                .downcast_ref::<FarrierError>()
                .map(FarrierError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "farrier=warn",
        1 => "farrier=info",
        _ => "farrier=debug",
    };
    let filter = EnvFilter::try_from_env("FARRIER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
