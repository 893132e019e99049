//! Run lifecycle controller.
//!
//! Multiplexes user commands, Ctrl-C and process/timer events into a single
//! [`Runner`], so every state change happens on one task.

use super::runner::{RunStart, Runner};
use crate::config::ConfigOverrides;
use crate::error::RunError;
use crate::model::{CommandSpec, JobEvent, RunKind, RunReport};
use crate::sink::{NotifyLevel, OutputSink};
use crate::supervisor::process::Spawner;
use crate::supervisor::SupervisorState;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// Commands typed into an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UiCommand {
    Build(Option<CommandSpec>),
    Clean(Option<CommandSpec>),
    Stop,
    Set(String),
    Status,
    Quit,
    Unknown(String),
}

impl UiCommand {
    /// Parse one input line. Blank lines yield `None`.
    ///
    /// Anything after `build`/`clean` is an inline shell command override.
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let overriding = || (!rest.is_empty()).then(|| CommandSpec::Shell(rest.to_string()));
        Some(match word {
            "build" | "b" => Self::Build(overriding()),
            "clean" | "c" => Self::Clean(overriding()),
            "stop" => Self::Stop,
            "set" => Self::Set(rest.to_string()),
            "status" => Self::Status,
            "quit" | "q" | "exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

/// Forward stdin lines as commands until EOF. Dropping the sender reads as quit.
pub(crate) async fn read_commands(cmd_tx: UnboundedSender<UiCommand>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(cmd) = UiCommand::parse(&line) {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("failed to read stdin: {e}");
                break;
            }
        }
    }
}

/// Start one run and drive it to completion. Ctrl-C asks the job to stop.
///
/// `Ok(None)` when there was nothing to run.
pub(crate) async fn run_once<S: OutputSink, P: Spawner>(
    runner: &mut Runner<S, P>,
    events: &mut UnboundedReceiver<JobEvent>,
    kind: RunKind,
    overriding: Option<CommandSpec>,
) -> Result<Option<RunReport>, RunError> {
    if let RunStart::NothingConfigured = runner.run(kind, overriding)? {
        return Ok(None);
    }

    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else {
                    tracing::warn!("event queue closed before the job finished");
                    return Ok(None);
                };
                if let Some(report) = runner.handle_event(ev) {
                    return Ok(Some(report));
                }
            }
            _ = &mut ctrl_c => {
                // Re-arm so a second Ctrl-C is observed too; the grace timer
                // already guarantees escalation.
                ctrl_c = Box::pin(tokio::signal::ctrl_c());
                if let Ok(true) = runner.stop() {
                    runner.notify("Stopping…", NotifyLevel::Info);
                }
            }
        }
    }
}

/// Interactive session: serve commands until `quit` (or end of input).
///
/// Quit while a job is running stops it and returns only after it exits.
/// Every finished run is handed to `on_report`.
pub(crate) async fn run_session<S: OutputSink, P: Spawner>(
    runner: &mut Runner<S, P>,
    events: &mut UnboundedReceiver<JobEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    mut on_report: impl FnMut(RunReport),
) {
    let mut input_open = true;
    let mut quit_pending = false;
    // If a stop takes too long, say so instead of looking hung.
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = async {
                if input_open {
                    cmd_rx.recv().await
                } else {
                    futures::future::pending().await
                }
            } => {
                let cmd = cmd.unwrap_or_else(|| {
                    input_open = false;
                    UiCommand::Quit
                });
                tracing::debug!(?cmd, "session command");
                match cmd {
                    UiCommand::Build(overriding) => {
                        let _ = runner.run(RunKind::Build, overriding);
                    }
                    UiCommand::Clean(overriding) => {
                        let _ = runner.run(RunKind::Clean, overriding);
                    }
                    UiCommand::Stop => {
                        if let Ok(true) = runner.stop() {
                            runner.notify("Stopping…", NotifyLevel::Info);
                            stop_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    UiCommand::Set(assignment) => {
                        let mut overrides = ConfigOverrides::new();
                        let parsed = overrides.set_assignment(&assignment).map(|_| ());
                        match parsed {
                            Ok(()) => {
                                runner.update_config(&overrides);
                            }
                            Err(e) => runner.notify(&format!("{e:#}"), NotifyLevel::Warn),
                        }
                    }
                    UiCommand::Status => {
                        let status = runner.status();
                        let text = if status.is_empty() { "no project name set".to_string() } else { status };
                        runner.notify(&text, NotifyLevel::Info);
                        match runner.job_state() {
                            (SupervisorState::Running, Some(stage)) => {
                                runner.notify(&format!("job running (watchdog: {stage:?})"), NotifyLevel::Info);
                            }
                            (SupervisorState::Finished(outcome), _) => {
                                runner.notify(&format!("last job: {outcome:?}"), NotifyLevel::Info);
                            }
                            _ => {}
                        }
                    }
                    UiCommand::Quit => {
                        quit_pending = true;
                        if !runner.is_running() {
                            break;
                        }
                        if let Ok(true) = runner.stop() {
                            runner.notify("Stopping…", NotifyLevel::Info);
                        }
                        stop_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                    }
                    UiCommand::Unknown(line) => {
                        runner.notify(
                            &format!("unknown command `{line}` (try build, clean, stop, set, status, quit)"),
                            NotifyLevel::Warn,
                        );
                    }
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                if let Some(report) = runner.handle_event(ev) {
                    stop_deadline = None;
                    on_report(report);
                    if quit_pending {
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if tokio::time::Instant::now() >= deadline && runner.is_running() {
                        runner.notify("Still stopping…", NotifyLevel::Info);
                        stop_deadline = None;
                    }
                }
            }
        }
    }
}
