//! Error taxonomy for run requests.
//!
//! A non-zero process exit is not an error here: it is a normal terminal state
//! carried by [`crate::model::RunReport`].

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid command: argv is empty")]
    InvalidCommand,
    #[error("failed to start `{program}`: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("a job is already running; stop it before starting another")]
    AlreadyRunning,
    #[error("no job is running")]
    NoJobRunning,
    #[error("{}", config_failure_message(.path, .field.as_deref(), .reason))]
    ConfigLoadFailure {
        path: PathBuf,
        field: Option<String>,
        reason: String,
    },
}

fn config_failure_message(path: &std::path::Path, field: Option<&str>, reason: &str) -> String {
    match field {
        Some(field) => format!("{}: field `{}`: {}", path.display(), field, reason),
        None => format!("{}: {}", path.display(), reason),
    }
}

impl RunError {
    /// Warnings are surfaced to the user but leave the runner fully usable.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            RunError::AlreadyRunning | RunError::NoJobRunning | RunError::ConfigLoadFailure { .. }
        )
    }
}
