use serde::{Deserialize, Serialize};
use std::fmt;

/// The two actions a run can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Build,
    Clean,
}

impl RunKind {
    /// Present-progressive verb used in the run header.
    pub fn action(self) -> &'static str {
        match self {
            RunKind::Build => "Building",
            RunKind::Clean => "Cleaning",
        }
    }

    /// Noun used in completion commentary.
    pub fn noun(self) -> &'static str {
        match self {
            RunKind::Build => "Build",
            RunKind::Clean => "Clean",
        }
    }
}

/// A configured or overriding command.
///
/// A shell string goes through the platform interpreter; an argv is executed directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Blank strings and empty argv count as "not given" during resolution.
    pub fn is_blank(&self) -> bool {
        match self {
            CommandSpec::Shell(s) => s.trim().is_empty(),
            CommandSpec::Argv(v) => v.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    Horizontal,
    Vertical,
    Never,
}

impl DisplayMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "horizontal" => Some(DisplayMode::Horizontal),
            "vertical" => Some(DisplayMode::Vertical),
            "never" => Some(DisplayMode::Never),
            _ => None,
        }
    }
}

/// Which process pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Identifies one job for the lifetime of the supervisor. Events carrying a stale id are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStage {
    /// `timeout_seconds` elapsed: issue the soft-stop.
    Timeout,
    /// `kill_grace_ms` elapsed after a soft-stop: deliver the hard-kill signal.
    KillGrace,
}

/// Everything the process side and the timers report to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    OutputChunk {
        job: JobId,
        stream: StreamKind,
        data: Vec<String>,
    },
    Exit {
        job: JobId,
        code: i32,
    },
    Watchdog {
        job: JobId,
        stage: WatchdogStage,
    },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::OutputChunk { job, .. }
            | JobEvent::Exit { job, .. }
            | JobEvent::Watchdog { job, .. } => *job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutState {
    None,
    Armed,
    SoftStopIssued,
    HardKillIssued,
    Finished,
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    /// A soft-stop or hard-kill was issued before the process exited.
    Killed,
}

/// Final summary of a run, handed back to the caller for UI decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub kind: RunKind,
    pub job: JobId,
    pub command: String,
    pub exit_code: i32,
    pub success: bool,
    pub outcome: JobOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub finished_utc: String,
    #[serde(default)]
    pub phrase: Option<String>,
}
