type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod descriptor;
mod driver;
mod error;
mod expectation;
mod http_server;
mod process_runner;
mod report;
mod suite;

use clap::{CommandFactory, Parser};
use eyre::WrapErr;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Action, Cli, Config};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    match Action::from_cli(cli)? {
        Action::Help => {
            Cli::command().print_help()?;
            Ok(ExitCode::SUCCESS)
        }
        Action::CheckOutput { log_file, verbose } => {
            init_tracing(verbose);
            check_output(log_file)
        }
        Action::Run(config) => {
            init_tracing(config.verbose);
            run(config).await
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(config: Config) -> Result<ExitCode> {
    info!("Running {} test(s)", config.tests.len());

    let report = suite::run_suite(&config.tests, &config.suite, &config.driver).await?;
    report.log_summary();

    if let Some(path) = &config.json_report {
        report
            .write_json(path)
            .wrap_err_with(|| format!("Failed to write JSON report {}", path.display()))?;
        debug!("JSON report written to {}", path.display());
    }

    Ok(exit_code(report.all_passed()))
}

/// Verifies a log file, or stdin, printing each mismatch to stderr.
fn check_output(log_file: Option<PathBuf>) -> Result<ExitCode> {
    let mismatches = match &log_file {
        Some(path) => {
            let file = std::fs::File::open(path)
                .wrap_err_with(|| format!("Cannot open {}", path.display()))?;
            expectation::verify_reader(BufReader::new(file))?
        }
        None => expectation::verify_reader(std::io::stdin().lock())?,
    };

    for mismatch in &mismatches {
        eprintln!("{mismatch}");
    }
    debug!("{} mismatch(es)", mismatches.len());
    Ok(exit_code(expectation::passed(&mismatches)))
}

fn exit_code(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
