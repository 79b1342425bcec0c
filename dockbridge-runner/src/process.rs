//! Bounded execution of a single shell command line.
//!
//! [`ProcessRunner`] launches the line through a shell with stdout and stderr both
//! piped, collects everything the child writes into one buffer in arrival order, and
//! stops the child when the deadline passes or the caller cancels. Every call ends in
//! exactly one [`ExecutionOutcome`]; the child has always been reaped by then.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use chrono::Utc;
use dockbridge_core::{CommandSpec, ExecutionOutcome, Termination};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::sleep_until;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 8 * 1024;

/// The interpreter a command line is handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shell {
    /// `sh -c <line>`
    Posix,
    /// `cmd /C <line>`
    Cmd,
    Custom { program: String, flag: String },
}

impl Shell {
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Shell::Cmd
        } else {
            Shell::Posix
        }
    }

    pub fn program(&self) -> &str {
        match self {
            Shell::Posix => "sh",
            Shell::Cmd => "cmd",
            Shell::Custom { program, .. } => program,
        }
    }

    pub fn flag(&self) -> &str {
        match self {
            Shell::Posix => "-c",
            Shell::Cmd => "/C",
            Shell::Custom { flag, .. } => flag,
        }
    }

    fn command(&self, line: &str) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.arg(self.flag());
        // cmd.exe does its own parsing; quoting the line again would break it.
        #[cfg(windows)]
        if *self == Shell::Cmd {
            cmd.raw_arg(line);
            return cmd;
        }
        cmd.arg(line);
        cmd
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Settings shared by every command a runner launches
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub shell: Shell,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
    /// How long to keep reading once the child is gone before the pipes are closed.
    pub drain_grace: Duration,
    /// Upper bound on captured bytes. Exceeding it ends the run as a capture failure.
    pub max_output_bytes: Option<usize>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: Shell::platform_default(),
            env: Vec::new(),
            working_directory: None,
            drain_grace: Duration::from_millis(500),
            max_output_bytes: None,
        }
    }
}

/// Anything that can turn a [`CommandSpec`] into an [`ExecutionOutcome`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, spec: &CommandSpec) -> ExecutionOutcome;
}

#[async_trait]
impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    async fn execute(&self, spec: &CommandSpec) -> ExecutionOutcome {
        (**self).execute(spec).await
    }
}

/// Runs shell command lines with a deadline
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: ProcessConfig,
    cancel: Option<CancelToken>,
}

/// Where the supervision loop stopped.
enum RunState {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    CaptureFailed(String),
    Lost(io::Error),
}

impl ProcessRunner {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Every later `run` also stops when `token` fires.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Run `spec` to completion, timeout, or cancellation of the runner's token.
    pub async fn run(&self, spec: &CommandSpec) -> ExecutionOutcome {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                let started = Instant::now();
                debug!(command = %spec.command, "Runner already cancelled, not launching");
                finish(
                    Uuid::new_v4(),
                    spec,
                    Termination::Cancelled,
                    Vec::new(),
                    None,
                    started,
                )
            }
            Some(token) => self.run_until(spec, token.cancelled()).await,
            None => self.run_until(spec, std::future::pending::<()>()).await,
        }
    }

    /// Run `spec`, additionally stopping the child as soon as `cancel` resolves.
    pub async fn run_until<F>(&self, spec: &CommandSpec, cancel: F) -> ExecutionOutcome
    where
        F: Future<Output = ()>,
    {
        let id = Uuid::new_v4();
        let started = Instant::now();
        // A timeout past the clock's range is no deadline at all.
        let deadline = spec
            .timeout
            .and_then(|t| tokio::time::Instant::now().checked_add(t));

        info!(
            invocation_id = %id,
            command = %spec.command,
            timeout_ms = ?spec.timeout.map(|t| t.as_millis()),
            "Launching command"
        );

        let mut child = match self.spawn(&spec.command) {
            Ok(child) => child,
            Err(e) => {
                warn!(invocation_id = %id, error = %e, "Failed to launch command");
                return finish(
                    id,
                    spec,
                    Termination::LaunchFailed {
                        reason: format!("failed to launch {}: {}", self.config.shell.program(), e),
                    },
                    Vec::new(),
                    None,
                    started,
                );
            }
        };

        let pid = child.id();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut capture = Capture::new(self.config.max_output_bytes);
        let mut out_chunk = vec![0u8; READ_CHUNK];
        let mut err_chunk = vec![0u8; READ_CHUNK];

        let expiry = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);
        tokio::pin!(cancel);

        let state = loop {
            tokio::select! {
                biased;

                status = child.wait() => {
                    break match status {
                        Ok(status) => RunState::Exited(status),
                        Err(e) => RunState::Lost(e),
                    };
                }
                _ = &mut expiry => break RunState::TimedOut,
                _ = &mut cancel => break RunState::Cancelled,
                read = read_chunk(&mut stdout, &mut out_chunk) => {
                    if let Err(reason) = absorb(read, &out_chunk, &mut stdout, &mut capture, "stdout") {
                        break RunState::CaptureFailed(reason);
                    }
                }
                read = read_chunk(&mut stderr, &mut err_chunk) => {
                    if let Err(reason) = absorb(read, &err_chunk, &mut stderr, &mut capture, "stderr") {
                        break RunState::CaptureFailed(reason);
                    }
                }
            }
        };

        let termination = match state {
            RunState::Exited(status) => Termination::Exited {
                code: exit_code(status),
            },
            RunState::TimedOut => {
                warn!(
                    invocation_id = %id,
                    pid = ?pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Command exceeded its deadline, terminating"
                );
                Termination::TimedOut
            }
            RunState::Cancelled => {
                info!(invocation_id = %id, pid = ?pid, "Command cancelled, terminating");
                Termination::Cancelled
            }
            RunState::CaptureFailed(reason) => {
                warn!(invocation_id = %id, reason = %reason, "Output capture failed, terminating");
                Termination::CaptureFailed { reason }
            }
            RunState::Lost(e) => {
                warn!(invocation_id = %id, error = %e, "Lost track of child process");
                Termination::CaptureFailed {
                    reason: format!("failed to wait for child process: {}", e),
                }
            }
        };

        if !matches!(termination, Termination::Exited { .. }) {
            terminate(&mut child, pid);
            if let Err(e) = child.wait().await {
                warn!(invocation_id = %id, pid = ?pid, error = %e, "Failed to reap child process");
            }
        }

        // Whatever the child wrote before it stopped is still kept.
        let termination = match termination {
            Termination::CaptureFailed { .. } => termination,
            _ => {
                let drained = drain(
                    &mut stdout,
                    &mut stderr,
                    &mut capture,
                    self.config.drain_grace,
                )
                .await;
                match (drained, termination) {
                    (Err(reason), Termination::Exited { .. }) => {
                        warn!(invocation_id = %id, reason = %reason, "Output capture failed while draining");
                        Termination::CaptureFailed { reason }
                    }
                    (_, termination) => termination,
                }
            }
        };

        let outcome = finish(id, spec, termination, capture.into_bytes(), pid, started);
        info!(
            invocation_id = %id,
            termination = ?outcome.termination,
            output_bytes = outcome.output.len(),
            duration_ms = outcome.duration_ms,
            "Command finished"
        );
        outcome
    }

    fn spawn(&self, line: &str) -> io::Result<Child> {
        let mut cmd = self.config.shell.command(line);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }

        // Own process group, so a timeout takes the shell's children down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }
}

#[async_trait]
impl CommandExecutor for ProcessRunner {
    async fn execute(&self, spec: &CommandSpec) -> ExecutionOutcome {
        self.run(spec).await
    }
}

/// Growable output buffer that refuses to grow past its limit or past what the
/// allocator will give it.
struct Capture {
    bytes: Vec<u8>,
    limit: Option<usize>,
}

impl Capture {
    fn new(limit: Option<usize>) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), String> {
        if let Some(limit) = self.limit {
            if self.bytes.len() + chunk.len() > limit {
                return Err(format!("captured output exceeded {} bytes", limit));
            }
        }
        self.bytes
            .try_reserve(chunk.len())
            .map_err(|e| format!("could not grow output buffer: {}", e))?;
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader.as_mut() {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Folds one read result into the capture. A closed or broken pipe just stops
/// being read; only the capture itself can fail.
fn absorb<R>(
    read: io::Result<usize>,
    chunk: &[u8],
    reader: &mut Option<R>,
    capture: &mut Capture,
    stream: &'static str,
) -> Result<(), String> {
    match read {
        Ok(0) => {
            debug!(stream, "Pipe closed");
            *reader = None;
            Ok(())
        }
        Ok(n) => capture.push(&chunk[..n]),
        Err(e) => {
            debug!(stream, error = %e, "Pipe read failed, no longer reading it");
            *reader = None;
            Ok(())
        }
    }
}

/// Reads both pipes until EOF or until `grace` runs out.
async fn drain<R1, R2>(
    stdout: &mut Option<R1>,
    stderr: &mut Option<R2>,
    capture: &mut Capture,
    grace: Duration,
) -> Result<(), String>
where
    R1: AsyncRead + Unpin,
    R2: AsyncRead + Unpin,
{
    let mut out_chunk = vec![0u8; READ_CHUNK];
    let mut err_chunk = vec![0u8; READ_CHUNK];

    let drained = tokio::time::timeout(grace, async {
        loop {
            tokio::select! {
                read = read_chunk(&mut *stdout, &mut out_chunk), if stdout.is_some() => {
                    if let Err(reason) = absorb(read, &out_chunk, &mut *stdout, &mut *capture, "stdout") {
                        return Err(reason);
                    }
                }
                read = read_chunk(&mut *stderr, &mut err_chunk), if stderr.is_some() => {
                    if let Err(reason) = absorb(read, &err_chunk, &mut *stderr, &mut *capture, "stderr") {
                        return Err(reason);
                    }
                }
                else => return Ok(()),
            }
        }
    })
    .await;

    match drained {
        Ok(result) => result,
        Err(_) => {
            // Usually a background job of the command still holds the pipe.
            debug!(grace_ms = grace.as_millis() as u64, "Pipes still open after drain grace, closing them");
            Ok(())
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => {
                debug!(pgid = raw, "Sent SIGKILL to process group");
                return;
            }
            Err(Errno::ESRCH) => debug!(pgid = raw, "Process group already gone"),
            Err(e) => warn!(pgid = raw, error = %e, "Failed to signal process group"),
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill not delivered, child already exited");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!(pid = ?pid, error = %e, "Kill not delivered, child already exited");
    }
}

/// Exit code of a finished child. A child killed by a foreign signal reports
/// `128 + signal`, the way shells do.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn finish(
    id: Uuid,
    spec: &CommandSpec,
    termination: Termination,
    output: Vec<u8>,
    pid: Option<u32>,
    started: Instant,
) -> ExecutionOutcome {
    let duration = started.elapsed();
    let completed_at = Utc::now();
    let started_at = completed_at
        - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

    ExecutionOutcome {
        id,
        command: spec.command.clone(),
        termination,
        output: String::from_utf8_lossy(&output).into_owned(),
        pid,
        duration_ms: duration.as_millis() as u64,
        started_at,
        completed_at,
    }
}
