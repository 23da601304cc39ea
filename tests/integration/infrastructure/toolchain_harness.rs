use anyhow::{anyhow, Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Upper bound for a whole kernel-tester invocation in these tests
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Fake configure/make/simulator scripts in a temporary directory, plus a
/// way to run the kernel-tester binary against them.
///
/// The fake simulator prints `outputs/<test name>.txt`, so each test decides
/// what "the kernel" prints by calling [`ToolchainHarness::simulator_output`].
/// Configuring a test named `broken` fails.
pub struct ToolchainHarness {
    temp_dir: TempDir,
}

/// Exit status and log output of one kernel-tester invocation
#[derive(Debug)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

impl ToolchainHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let harness = Self { temp_dir };
        std::fs::create_dir(harness.outputs_dir())?;

        harness.write_tool(
            "configure",
            r#"echo "$@" > configure.args
case "$*" in
    *--kernel-test=broken*) echo "configure: no such test"; exit 1;;
esac"#,
        )?;
        harness.write_tool("make", "echo \"make $*\"")?;
        harness.write_tool(
            "msim",
            &format!(
                r#"name=$(sed -n 's/.*--kernel-test=\([^ ]*\).*/\1/p' configure.args)
cat "{}/$name.txt""#,
                harness.outputs_dir().display()
            ),
        )?;
        Ok(harness)
    }

    /// Root of the temporary directory (also the working directory of runs)
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    fn outputs_dir(&self) -> PathBuf {
        self.path().join("outputs")
    }

    /// Writes an executable shell script into the temporary directory
    pub fn write_tool(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Sets what the fake simulator prints for a test
    pub fn simulator_output(&self, test_name: &str, output: &str) -> Result<()> {
        std::fs::write(self.outputs_dir().join(format!("{test_name}.txt")), output)?;
        Ok(())
    }

    /// Runs a `kernel` or `suite` subcommand against the fake toolchain
    pub async fn run_tests(&self, args: &[&str]) -> Result<RunOutput> {
        let tools = self.path();
        let mut full_args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        for (flag, value) in [
            ("--configure-script", tools.join("configure")),
            ("--make", tools.join("make")),
            ("--simulator", tools.join("msim")),
            ("--build-root", tools.join("target")),
        ] {
            full_args.push(flag.to_string());
            full_args.push(value.to_string_lossy().into_owned());
        }
        full_args.extend(
            ["--http-port", "0", "--http-bind-addr", "127.0.0.1"]
                .iter()
                .map(|a| a.to_string()),
        );
        self.run(&full_args, None).await
    }

    /// Runs kernel-tester with exactly the given arguments
    pub async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<RunOutput> {
        let mut command = Command::new(env!("CARGO_BIN_EXE_kernel-tester"));
        command
            .args(args)
            .current_dir(self.path())
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().context("Failed to spawn kernel-tester")?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
        }

        let output = timeout(RUN_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("kernel-tester did not finish within {:?}", RUN_TIMEOUT))??;
        Ok(RunOutput {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Build directory the tester created for a kernel test descriptor
    pub fn build_dir(&self, descriptor: &str) -> Result<PathBuf> {
        let prefix = format!("kernel__{}-", descriptor.replace(':', "_"));
        for entry in std::fs::read_dir(self.path().join("target"))? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(entry.path());
            }
        }
        Err(anyhow!("no build directory for {}", descriptor))
    }

    pub fn read_json(&self, name: &str) -> Result<serde_json::Value> {
        let content = std::fs::read_to_string(self.path().join(name))?;
        Ok(serde_json::from_str(&content)?)
    }
}
