use crate::error::SupervisionError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{self, Pid};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Exit code reported for a process the supervisor had to kill after its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Default wall-clock limit for a single subprocess.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// How many times SIGTERM/SIGKILL are (re)issued before giving up.
const TERMINATION_ROUNDS: u32 = 5;

/// Wait after each termination signal before probing again.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on the time spent terminating a timed-out process.
pub const ESCALATION_BUDGET: Duration =
    Duration::from_secs(2 * TERMINATION_ROUNDS as u64 * TERMINATION_GRACE.as_secs());

/// How long to wait for the output pipe to drain once the process has exited.
///
/// A descendant that escaped the process group could keep the pipe open forever.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the subprocess reads its standard input from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StdinSource {
    /// Standard input is closed (`/dev/null`)
    #[default]
    Null,
    /// Standard input is read from a file
    File(PathBuf),
}

/// A single subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Working directory of the process
    pub working_dir: PathBuf,
    /// File receiving the merged stdout/stderr stream
    pub log_path: PathBuf,
    /// Wall-clock limit measured from launch
    pub timeout: Duration,
    /// Standard input source
    pub stdin: StdinSource,
}

impl RunRequest {
    pub fn new(
        command: Vec<String>,
        working_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
            log_path: log_path.into(),
            timeout: DEFAULT_TIMEOUT,
            stdin: StdinSource::Null,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    /// Program name used in log lines and error messages.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("<empty command>")
    }
}

/// How a subprocess invocation ended. Exactly one of an exit code or a
/// supervision failure.
#[derive(Debug)]
pub enum RunOutcome {
    Exited(i32),
    Failed(SupervisionError),
}

/// Result of one subprocess invocation.
#[derive(Debug)]
pub struct ProcessRun {
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    /// Output lines in emission order, trailing whitespace removed
    pub captured_lines: Vec<String>,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

impl ProcessRun {
    /// Exit code of the process, [`TIMEOUT_EXIT_CODE`] if it was killed after
    /// its deadline, `None` for other supervision failures.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.outcome {
            RunOutcome::Exited(code) => Some(*code),
            RunOutcome::Failed(e) if e.is_timeout() => Some(TIMEOUT_EXIT_CODE),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SupervisionError> {
        match &self.outcome {
            RunOutcome::Failed(e) => Some(e),
            RunOutcome::Exited(_) => None,
        }
    }

    /// Splits the run into its exit code and captured output, or the
    /// supervision failure.
    pub fn into_result(self) -> Result<(i32, Vec<String>), SupervisionError> {
        match self.outcome {
            RunOutcome::Exited(code) => Ok((code, self.captured_lines)),
            RunOutcome::Failed(e) => Err(e),
        }
    }
}

/// Runs a subprocess to completion or until its timeout expires.
///
/// stdout and stderr share one pipe, so the log file and `captured_lines`
/// preserve the order in which the process wrote them. The log file always
/// exists afterwards, even when the process could not be launched.
pub async fn run(request: RunRequest) -> ProcessRun {
    let started = Instant::now();
    let mut captured_lines = Vec::new();
    let outcome = match supervise(&request, started, &mut captured_lines).await {
        Ok(code) => RunOutcome::Exited(code),
        Err(e) => RunOutcome::Failed(e),
    };

    let run = ProcessRun {
        command: request.command,
        working_dir: request.working_dir,
        log_path: request.log_path,
        captured_lines,
        outcome,
        elapsed: started.elapsed(),
    };
    if let Some(e) = run.failure() {
        warn!("{}", e);
    }
    debug!(
        exit_code = ?run.exit_code(),
        "{:?} in {} finished after {:.1?}, output in {}",
        run.command,
        run.working_dir.display(),
        run.elapsed,
        run.log_path.display()
    );
    run
}

async fn supervise(
    request: &RunRequest,
    started: Instant,
    captured_lines: &mut Vec<String>,
) -> Result<i32, SupervisionError> {
    let program = request.program().to_string();
    let io_error = |source: io::Error| SupervisionError::Io {
        program: program.clone(),
        source,
    };

    let log_file = File::create(&request.log_path).await.map_err(io_error)?;
    if request.command.is_empty() {
        return Err(SupervisionError::Launch {
            program: program.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        });
    }

    let (read_end, write_end) = output_pipe().map_err(io_error)?;
    let mut child = spawn(request, write_end).map_err(|source| SupervisionError::Launch {
        program: program.clone(),
        source,
    })?;
    let pid = match child.id() {
        Some(pid) => Pid::from_raw(pid as i32),
        None => return Err(io_error(io::Error::other("process exited before its PID was read"))),
    };
    info!("Started {} with PID {} in {}", program, pid, request.working_dir.display());

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let receiver = pipe::Receiver::from_owned_fd(read_end).map_err(io_error)?;
    let mut capture = tokio::spawn(capture_output(receiver, log_file, program.clone(), line_tx));

    let waited = match timeout(request.timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(io_error(e)),
        Err(_) => {
            let elapsed = started.elapsed();
            error!(
                "Forcefully killing {:?} (giving up after {:?})",
                request.command, ESCALATION_BUDGET
            );
            if terminate(&mut child, pid, &program).await {
                Err(SupervisionError::Timeout {
                    program: program.clone(),
                    elapsed,
                })
            } else {
                error!("Failed to kill {:?}", request.command);
                Err(SupervisionError::Unkillable {
                    program: program.clone(),
                    pid: pid.as_raw(),
                })
            }
        }
    };

    let captured = match timeout(IO_CAPTURE_TIMEOUT, &mut capture).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(io::Error::other(e)),
        Err(_) => {
            warn!("Output of {} still open after exit, abandoning capture", program);
            capture.abort();
            Ok(())
        }
    };
    while let Ok(line) = line_rx.try_recv() {
        captured_lines.push(line);
    }

    let status = waited?;
    captured.map_err(io_error)?;
    let code = exit_code(status);
    debug!("{} exited with code {}", program, code);
    Ok(code)
}

/// Creates the pipe shared by the child's stdout and stderr.
///
/// Both ends are close-on-exec; the child only sees the copies dup'ed onto
/// its descriptors 1 and 2.
fn output_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        flags.insert(FdFlag::FD_CLOEXEC);
        fcntl(fd, FcntlArg::F_SETFD(flags))?;
    }
    Ok((read_end, write_end))
}

fn spawn(request: &RunRequest, write_end: OwnedFd) -> io::Result<Child> {
    let stdin = match &request.stdin {
        StdinSource::Null => Stdio::null(),
        StdinSource::File(path) => Stdio::from(std::fs::File::open(path)?),
    };
    let stderr = write_end.try_clone()?;

    // The command owns the parent's copies of the write end; dropping it at the
    // end of this function is what lets the reader see EOF.
    let mut command = Command::new(&request.command[0]);
    command.args(&request.command[1..]);
    command.current_dir(&request.working_dir);
    command.stdin(stdin);
    command.stdout(Stdio::from(write_end));
    command.stderr(Stdio::from(stderr));
    // Own process group, so termination also reaches the process's children
    command.process_group(0);
    command.kill_on_drop(true);
    command.spawn()
}

/// Copies the merged output into the log file and forwards each line.
async fn capture_output(
    receiver: pipe::Receiver,
    mut log_file: File,
    program: String,
    lines: mpsc::UnboundedSender<String>,
) -> io::Result<()> {
    let mut reader = BufReader::new(receiver);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        log_file.write_all(line.as_bytes()).await?;
        log_file.flush().await?;

        let line = line.trim_end();
        debug!("[{}] {}", program, line);
        // The receiver outlives this task unless the run was abandoned
        let _ = lines.send(line.to_string());
    }
    log_file.flush().await?;
    log_file.sync_all().await
}

/// Escalates from SIGTERM to SIGKILL on the process group until the process
/// is gone. Returns false if it survived every round.
async fn terminate(child: &mut Child, pgid: Pid, program: &str) -> bool {
    for round in 1..=TERMINATION_ROUNDS {
        if has_exited(child) {
            return true;
        }
        send_signal(pgid, Signal::SIGTERM, program);
        if wait_briefly(child).await {
            return true;
        }
        send_signal(pgid, Signal::SIGKILL, program);
        if wait_briefly(child).await {
            return true;
        }
        warn!("{} (PID {}) survived termination round {}", program, pgid, round);
    }
    has_exited(child)
}

fn has_exited(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(status) => status.is_some(),
        Err(e) => {
            // Nothing left to wait for
            debug!("try_wait failed: {}", e);
            true
        }
    }
}

async fn wait_briefly(child: &mut Child) -> bool {
    timeout(TERMINATION_GRACE, child.wait()).await.is_ok()
}

fn send_signal(pgid: Pid, signal: Signal, program: &str) {
    match killpg(pgid, signal) {
        Ok(()) => debug!("Sent {:?} to {} (process group {})", signal, program, pgid),
        // Exited between the liveness probe and the signal
        Err(Errno::ESRCH) => debug!("{} already exited before {:?}", program, signal),
        Err(e) => warn!("Failed to send {:?} to {}: {}", signal, program, e),
    }
}

/// Exit code, or the negated signal number for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}
