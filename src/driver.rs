use crate::descriptor::{build_dir_name, TestDescriptor};
use crate::error::{FailureKind, Stage, TestFailure};
use crate::expectation;
use crate::process_runner::{self, RunRequest, StdinSource};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};

/// Line announcing that the test is supposed to end in a kernel panic.
pub const MARKER_EXPECT_PANIC: &str = "[ ENDS WITH PANIC ]";
/// Substring of the line the kernel prints when it panics.
pub const MARKER_KERNEL_PANIC: &str = "Kernel panic:";
/// Line printed by a kernel test that ran to completion.
pub const MARKER_TEST_FINISHED: &str = "Test finished.";

const CONFIGURE_LOG: &str = "configure.log";
const BUILD_LOG: &str = "make.log";
const SIMULATOR_LOG: &str = "msim.log";
const REPORT_LOG: &str = "report.log";

/// External tools invoked by the pipeline, each as a program plus leading
/// arguments, with the per-stage timeouts.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub configure: Vec<String>,
    pub make: Vec<String>,
    pub simulator: Vec<String>,
    pub configure_timeout: Duration,
    pub build_timeout: Duration,
    pub execute_timeout: Duration,
    /// File fed to the simulator's standard input, closed stdin otherwise
    pub simulator_input: Option<PathBuf>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            configure: vec!["configure.py".to_string()],
            make: vec!["make".to_string()],
            simulator: vec!["../../msim".to_string()],
            configure_timeout: Duration::from_secs(60),
            build_timeout: Duration::from_secs(120),
            execute_timeout: Duration::from_secs(240),
            simulator_input: None,
        }
    }
}

/// Everything a kernel test needs besides its descriptor.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub toolchain: Toolchain,
    /// Directory under which each test gets its own build directory
    pub build_root: PathBuf,
    /// Extra arguments appended to every configure invocation
    pub configure_args: Vec<String>,
}

/// Pass/fail markers found in the simulator output.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Markers {
    pub should_panic: bool,
    pub actually_panicked: bool,
    pub found_test_passed: bool,
}

/// Scans output for markers, stopping at the first panic or finish line.
pub fn scan_markers<S: AsRef<str>>(lines: &[S]) -> Markers {
    let mut markers = Markers::default();
    for line in lines {
        let line = line.as_ref();
        if line == MARKER_EXPECT_PANIC {
            markers.should_panic = true;
        }
        if line.contains(MARKER_KERNEL_PANIC) {
            markers.actually_panicked = true;
            break;
        }
        if line == MARKER_TEST_FINISHED {
            markers.found_test_passed = true;
            break;
        }
    }
    markers
}

/// Decides whether the execution stage passed from the simulator output.
pub fn classify<S: AsRef<str>>(lines: &[S]) -> Result<(), TestFailure> {
    let markers = scan_markers(lines);
    debug!(?markers, "classified simulator output");

    if markers.should_panic && !markers.actually_panicked {
        return Err(TestFailure::classification("test failed (did not panic)"));
    }
    // Success reported although a panic was announced
    let passed_unexpectedly = markers.found_test_passed && markers.should_panic;
    // Neither finished nor panicked as announced
    let inconclusive = !markers.found_test_passed && !markers.should_panic;
    if passed_unexpectedly || inconclusive {
        return Err(TestFailure::classification("test failed"));
    }
    Ok(())
}

/// Runs one kernel test: configure, build, execute, verify.
///
/// `descriptor` is the `name[:mNNN][:Dflag]*` string. The first failing stage
/// ends the test; nothing is retried.
pub async fn run_kernel_test(descriptor: &str, config: &DriverConfig) -> Result<(), TestFailure> {
    let parsed: TestDescriptor = descriptor.parse().map_err(|e: crate::error::DescriptorError| {
        TestFailure::new(
            Stage::Initialization,
            FailureKind::Setup,
            "initialization failed",
            e.to_string(),
        )
    })?;

    let span = info_span!("kernel", test = %parsed.raw());
    async move {
        let build_dir = prepare_build_dir(&config.build_root, &format!("kernel/{descriptor}"))?;
        debug!("Will use build directory {}.", build_dir.display());
        let test = KernelTest {
            descriptor: parsed,
            build_dir,
            config,
        };
        test.run().await
    }
    .instrument(span)
    .await
}

/// Creates an empty build directory for a test, removing any previous one.
pub fn prepare_build_dir(build_root: &Path, test_name: &str) -> Result<PathBuf, TestFailure> {
    let dir = build_root.join(build_dir_name(test_name));
    let setup_failure = |e: std::io::Error| {
        TestFailure::new(
            Stage::Initialization,
            FailureKind::Setup,
            "initialization failed",
            format!("cannot prepare {}: {}", dir.display(), e),
        )
    };
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(setup_failure(e)),
    }
    std::fs::create_dir_all(&dir).map_err(setup_failure)?;
    Ok(dir)
}

struct KernelTest<'a> {
    descriptor: TestDescriptor,
    build_dir: PathBuf,
    config: &'a DriverConfig,
}

impl KernelTest<'_> {
    async fn run(&self) -> Result<(), TestFailure> {
        self.configure().await?;
        self.build().await?;
        let output = self.execute().await?;
        classify(&output)?;
        self.verify(&output).await
    }

    async fn configure(&self) -> Result<(), TestFailure> {
        let args = self.descriptor.configure_args(&self.config.configure_args);
        info!("Configuring ({})...", args.join(" "));

        let mut command = self.config.toolchain.configure.clone();
        command.push("--verbose".to_string());
        command.extend(args);
        self.run_stage(
            Stage::Configuration,
            command,
            CONFIGURE_LOG,
            self.config.toolchain.configure_timeout,
            None,
            "configuration failed",
        )
        .await?;
        Ok(())
    }

    async fn build(&self) -> Result<(), TestFailure> {
        info!("Building ...");
        let jobs = std::thread::available_parallelism().map_or(1, |n| n.get());
        let mut command = self.config.toolchain.make.clone();
        command.push(format!("-j{jobs}"));
        self.run_stage(
            Stage::Build,
            command,
            BUILD_LOG,
            self.config.toolchain.build_timeout,
            None,
            "build failed",
        )
        .await?;
        Ok(())
    }

    async fn execute(&self) -> Result<Vec<String>, TestFailure> {
        info!("Running MSIM ...");
        let mut command = self.config.toolchain.simulator.clone();
        command.push("-n".to_string());
        self.run_stage(
            Stage::Execution,
            command,
            SIMULATOR_LOG,
            self.config.toolchain.execute_timeout,
            self.config.toolchain.simulator_input.as_deref(),
            "MSIM execution failed",
        )
        .await
    }

    /// Checks the captured simulator output and writes `report.log`.
    async fn verify(&self, output: &[String]) -> Result<(), TestFailure> {
        info!("Checking test output ...");
        let io_failure = |e: std::io::Error| {
            TestFailure::new(
                Stage::Verification,
                FailureKind::Setup,
                "test failed",
                format!("cannot write {REPORT_LOG}: {e}"),
            )
        };

        let mismatches = expectation::verify(output);

        let mut report = tokio::fs::File::create(self.build_dir.join(REPORT_LOG))
            .await
            .map_err(io_failure)?;
        for mismatch in &mismatches {
            debug!("{}", mismatch);
            report
                .write_all(format!("{mismatch}\n").as_bytes())
                .await
                .map_err(io_failure)?;
        }
        report.flush().await.map_err(io_failure)?;

        if expectation::passed(&mismatches) {
            Ok(())
        } else {
            Err(TestFailure::mismatches(mismatches.len()))
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        command: Vec<String>,
        log_name: &str,
        timeout: Duration,
        stdin: Option<&Path>,
        failure_message: &str,
    ) -> Result<Vec<String>, TestFailure> {
        let mut request = RunRequest::new(command, &self.build_dir, self.build_dir.join(log_name))
            .timeout(timeout);
        if let Some(input) = stdin {
            request = request.stdin(StdinSource::File(input.to_path_buf()));
        }
        let run = process_runner::run(request).await;
        debug!("{} stage took {:.1?}", stage, run.elapsed);
        let (code, output) = run
            .into_result()
            .map_err(|e| TestFailure::supervision(stage, e))?;
        if code != 0 {
            return Err(TestFailure::exit_code(stage, code, failure_message, log_name));
        }
        Ok(output)
    }
}
