use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Exit code reported by `legacy_code` for a command that never started or whose
/// output could not be captured.
pub const LAUNCH_FAILURE_CODE: i32 = -1;

/// Exit code reported by `legacy_code` for a command that was terminated before
/// it could exit on its own.
pub const TIMEOUT_CODE: i32 = -2;

/// A single command line to hand to the shell, plus its wall-clock budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    /// `None` means the command may run forever.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    /// Zero and negative values mean "no deadline".
    pub fn with_timeout_secs(mut self, seconds: i64) -> Self {
        self.timeout = u64::try_from(seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }
}

/// How a single invocation ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// The child ran to completion. Non-zero codes land here too.
    Exited { code: i32 },
    /// The deadline passed first; the child was killed and reaped.
    TimedOut,
    /// The caller asked for the command to stop; handled like a timeout.
    Cancelled,
    /// The shell could not be spawned.
    LaunchFailed { reason: String },
    /// The output buffer could not grow any further.
    CaptureFailed { reason: String },
}

/// Everything a caller learns about one `run` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub id: Uuid,
    pub command: String,
    pub termination: Termination,
    pub output: String,
    pub pid: Option<u32>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// The child's own exit code. `None` whenever the child did not finish by itself.
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut)
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// True for launch and capture failures, i.e. problems of the engine rather than
    /// of the command.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self.termination,
            Termination::LaunchFailed { .. } | Termination::CaptureFailed { .. }
        )
    }

    /// Single integer view: the exit code, `TIMEOUT_CODE` for timeout or
    /// cancellation, `LAUNCH_FAILURE_CODE` for engine failures.
    pub fn legacy_code(&self) -> i32 {
        match self.termination {
            Termination::Exited { code } => code,
            Termination::TimedOut | Termination::Cancelled => TIMEOUT_CODE,
            Termination::LaunchFailed { .. } | Termination::CaptureFailed { .. } => {
                LAUNCH_FAILURE_CODE
            }
        }
    }
}

/// Result of a deployment-level operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeployStatus {
    Success,
    Failed,
    DockerNotFound,
    ComposeNotFound,
    FileNotFound,
    Timeout,
    Cancelled,
}

impl DeployStatus {
    /// Maps a raw engine outcome onto a deployment status.
    pub fn from_outcome(outcome: &ExecutionOutcome) -> Self {
        match outcome.termination {
            Termination::Exited { code: 0 } => DeployStatus::Success,
            Termination::TimedOut => DeployStatus::Timeout,
            Termination::Cancelled => DeployStatus::Cancelled,
            _ => DeployStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Success => "SUCCESS",
            DeployStatus::Failed => "FAILED",
            DeployStatus::DockerNotFound => "DOCKER_NOT_FOUND",
            DeployStatus::ComposeNotFound => "COMPOSE_NOT_FOUND",
            DeployStatus::FileNotFound => "FILE_NOT_FOUND",
            DeployStatus::Timeout => "TIMEOUT",
            DeployStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Status of an orchestrator operation plus every command it ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    pub operation: String,
    pub status: DeployStatus,
    pub outcomes: Vec<ExecutionOutcome>,
}

impl DeployReport {
    pub fn new(operation: impl Into<String>, status: DeployStatus) -> Self {
        Self {
            operation: operation.into(),
            status,
            outcomes: Vec::new(),
        }
    }

    pub fn with_outcome(mut self, outcome: ExecutionOutcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Success
    }

    /// Output of the last command run, if any.
    pub fn last_output(&self) -> Option<&str> {
        self.outcomes.last().map(|o| o.output.as_str())
    }
}

/// A compose service definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ComposeService {
    pub name: String,
    pub image: Option<String>,
    pub build_context: Option<String>,
    pub ports: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub restart: Option<String>,
}

impl ComposeService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_build_context(mut self, context: impl Into<String>) -> Self {
        self.build_context = Some(context.into());
        self
    }

    pub fn with_port(mut self, mapping: impl Into<String>) -> Self {
        self.ports.push(mapping.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, service: impl Into<String>) -> Self {
        self.depends_on.push(service.into());
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }
}
