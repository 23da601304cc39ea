use clap::{Args, Parser, Subcommand};
use eyre::{eyre, WrapErr};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::descriptor::{load_suites, TestEntry};
use crate::driver::{DriverConfig, Toolchain};
use crate::http_server::{HttpServerConfig, DEFAULT_PORT};
use crate::suite::SuiteOptions;

type Result<T> = color_eyre::eyre::Result<T>;

/// Runs kernel tests in the MSIM simulator and verifies their output
#[derive(Parser)]
#[command(name = "kernel-tester")]
#[command(about = "Runs kernel tests in the MSIM simulator and verifies their output")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run kernel tests
    Kernel {
        /// Kernel test descriptors (name[:mSIZE][:DFLAG]...)
        #[arg(value_name = "TEST_NAME", required = true)]
        test_names: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run whole test suites
    Suite {
        /// Files with one `<type> <name>` pair per line
        #[arg(value_name = "SUITE_DESCRIPTOR_FILE", required = true)]
        suite_files: Vec<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Check a simulator log (or stdin) against the expectations it contains
    CheckOutput {
        /// Log to check, stdin if omitted
        log_file: Option<PathBuf>,

        /// Be verbose
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Be verbose
    #[arg(long)]
    pub verbose: bool,

    /// Stop execution on first failed test
    #[arg(long)]
    pub fail_fast: bool,

    /// Store test results in a JSON file
    #[arg(long, value_name = "FILENAME")]
    pub json_report: Option<PathBuf>,

    /// Extra argument for the configure script (repeatable)
    #[arg(long = "configure-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub configure_args: Vec<String>,

    /// Configure script
    #[arg(long, default_value = "configure.py")]
    pub configure_script: PathBuf,

    /// Build tool
    #[arg(long, default_value = "make")]
    pub make: PathBuf,

    /// Simulator binary
    #[arg(long, default_value = "../../msim")]
    pub simulator: PathBuf,

    /// File fed to the simulator's standard input
    #[arg(long, value_name = "FILE")]
    pub simulator_input: Option<PathBuf>,

    /// Directory holding per-test build directories
    #[arg(long, default_value = "target")]
    pub build_root: PathBuf,

    /// Configure timeout (seconds)
    #[arg(long, default_value = "60")]
    pub configure_timeout_secs: u64,

    /// Build timeout (seconds)
    #[arg(long, default_value = "120")]
    pub build_timeout_secs: u64,

    /// Simulator timeout (seconds)
    #[arg(long, default_value = "240")]
    pub execute_timeout_secs: u64,

    /// Port of the auxiliary HTTP server
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub http_port: u16,

    /// Address the auxiliary HTTP server binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub http_bind_addr: String,

    /// Directory served by the auxiliary HTTP server
    #[arg(long, default_value = ".")]
    pub http_root: PathBuf,
}

/// What the binary was asked to do
#[derive(Debug)]
pub enum Action {
    Help,
    Run(Config),
    CheckOutput {
        log_file: Option<PathBuf>,
        verbose: bool,
    },
}

/// Configuration of a test run
#[derive(Debug, Clone)]
pub struct Config {
    /// Tests in execution order
    pub tests: Vec<TestEntry>,
    pub verbose: bool,
    pub json_report: Option<PathBuf>,
    pub suite: SuiteOptions,
    pub driver: DriverConfig,
}

impl Action {
    /// Parse command line arguments into an action
    pub fn from_cli(cli: Cli) -> Result<Self> {
        match cli.command {
            None => Ok(Action::Help),
            Some(Commands::Kernel { test_names, run }) => {
                let tests = test_names.into_iter().map(TestEntry::kernel).collect();
                Ok(Action::Run(Config::from_run_args(tests, run)?))
            }
            Some(Commands::Suite { suite_files, run }) => {
                let tests = load_suites(&suite_files)?;
                Ok(Action::Run(Config::from_run_args(tests, run)?))
            }
            Some(Commands::CheckOutput { log_file, verbose }) => {
                Ok(Action::CheckOutput { log_file, verbose })
            }
        }
    }
}

impl Config {
    pub fn from_run_args(tests: Vec<TestEntry>, run: RunArgs) -> Result<Self> {
        let bind_address: IpAddr = run
            .http_bind_addr
            .parse()
            .map_err(|e| eyre!("Invalid bind address '{}': {}", run.http_bind_addr, e))?;
        let cwd = std::env::current_dir().wrap_err("Cannot determine current directory")?;

        // Tools run inside the per-test build directory, so anything that is
        // not a bare command name must be anchored at the invocation directory.
        let toolchain = Toolchain {
            configure: vec![absolute(&cwd, &run.configure_script)],
            make: vec![command_path(&cwd, &run.make)],
            simulator: vec![absolute(&cwd, &run.simulator)],
            configure_timeout: Duration::from_secs(run.configure_timeout_secs),
            build_timeout: Duration::from_secs(run.build_timeout_secs),
            execute_timeout: Duration::from_secs(run.execute_timeout_secs),
            simulator_input: run.simulator_input.map(|input| cwd.join(input)),
        };

        Ok(Config {
            tests,
            verbose: run.verbose,
            json_report: run.json_report,
            suite: SuiteOptions {
                fail_fast: run.fail_fast,
                server: HttpServerConfig {
                    bind_address,
                    port: run.http_port,
                    root: run.http_root,
                },
            },
            driver: DriverConfig {
                toolchain,
                build_root: cwd.join(run.build_root),
                configure_args: run.configure_args,
            },
        })
    }
}

fn absolute(cwd: &Path, path: &Path) -> String {
    cwd.join(path).to_string_lossy().into_owned()
}

/// Bare names are left for `PATH` lookup.
fn command_path(cwd: &Path, path: &Path) -> String {
    if path.components().count() > 1 {
        absolute(cwd, path)
    } else {
        path.to_string_lossy().into_owned()
    }
}
