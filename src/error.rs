//! Error types for the kernel tester
//!
//! Every failure that can end a single test is one of the variants below, so
//! callers branch on the kind of failure instead of matching message text.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the Process Runner itself, as opposed to a subprocess that
/// merely exited with a non-zero code.
#[derive(Error, Debug)]
pub enum SupervisionError {
    #[error("execution of {program} failed: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while supervising {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed-out after {} seconds", elapsed.as_secs())]
    Timeout { program: String, elapsed: Duration },

    #[error("failed to kill {program} (pid {pid}) after timing out")]
    Unkillable { program: String, pid: i32 },
}

impl SupervisionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Pipeline stage of a single test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialization,
    Configuration,
    Build,
    Execution,
    Verification,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initialization => "initialization",
            Stage::Configuration => "configuration",
            Stage::Build => "build",
            Stage::Execution => "execution",
            Stage::Verification => "verification",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong inside a stage.
#[derive(Debug)]
pub enum FailureKind {
    /// The stage's subprocess exited with a non-zero code.
    ExitCode(i32),
    /// The stage's subprocess could not be supervised to completion.
    Supervision(SupervisionError),
    /// Pass/fail markers in the simulator output were missing or contradictory.
    Classification,
    /// The expectation matcher reported this many mismatches.
    Mismatches(usize),
    /// The test could not even be set up.
    Setup,
}

impl FailureKind {
    /// Details carried by the failure beyond its message, for logging.
    pub fn detail(&self) -> Option<String> {
        match self {
            FailureKind::ExitCode(code) => Some(format!("exit code {code}")),
            FailureKind::Supervision(error) => Some(error.to_string()),
            FailureKind::Mismatches(1) => Some("1 mismatch".to_string()),
            FailureKind::Mismatches(count) => Some(format!("{count} mismatches")),
            FailureKind::Classification | FailureKind::Setup => None,
        }
    }
}

/// A test failed at some stage. Carries a short message for the report and a
/// pointer telling a human where to look next.
#[derive(Error, Debug)]
#[error("{message} ({diagnostic})")]
pub struct TestFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub diagnostic: String,
}

impl TestFailure {
    pub fn new(
        stage: Stage,
        kind: FailureKind,
        message: impl Into<String>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Non-zero exit code of a stage, pointing at that stage's log.
    pub fn exit_code(stage: Stage, code: i32, message: &str, log_name: &str) -> Self {
        Self::new(stage, FailureKind::ExitCode(code), message, format!("see {log_name}"))
    }

    /// Supervision failure of a stage's subprocess.
    pub fn supervision(stage: Stage, error: SupervisionError) -> Self {
        let message = match &error {
            SupervisionError::Timeout { program, .. } => format!("{program} timed-out"),
            SupervisionError::Launch { program, .. } | SupervisionError::Io { program, .. } => {
                format!("execution of {program} failed")
            }
            SupervisionError::Unkillable { program, .. } => format!("failed to kill {program}"),
        };
        let diagnostic = match &error {
            SupervisionError::Timeout { elapsed, .. } => {
                format!("timed-out after {} seconds", elapsed.as_secs())
            }
            SupervisionError::Launch { source, .. } | SupervisionError::Io { source, .. } => {
                source.to_string()
            }
            SupervisionError::Unkillable { pid, .. } => format!("pid {pid} survived SIGKILL"),
        };
        Self::new(stage, FailureKind::Supervision(error), message, diagnostic)
    }

    pub fn classification(message: &str) -> Self {
        Self::new(
            Stage::Execution,
            FailureKind::Classification,
            message,
            "see msim.log",
        )
    }

    pub fn mismatches(count: usize) -> Self {
        Self::new(
            Stage::Verification,
            FailureKind::Mismatches(count),
            "test failed",
            "see report.log",
        )
    }
}

/// Errors in test descriptors and suite files.
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("unknown directive {directive} in {descriptor}")]
    UnknownDirective {
        descriptor: String,
        directive: String,
    },

    #[error("invalid memory size {value} in {descriptor}")]
    InvalidMemorySize { descriptor: String, value: String },

    #[error("empty test name in {0:?}")]
    EmptyName(String),

    #[error("invalid suite file {}: invalid line {line}", path.display())]
    InvalidSuiteLine { path: PathBuf, line: String },

    #[error("failed to read suite file {}: {source}", path.display())]
    SuiteRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that abort a whole suite run.
#[derive(Error, Debug)]
pub enum SuiteError {
    #[error("failed to start HTTP server on port {port}: {source}")]
    Server {
        port: u16,
        #[source]
        source: io::Error,
    },
}
