//! Build/clean orchestration on top of the job supervisor.

use super::resolve::resolve;
use crate::config::{Config, ConfigOverrides, ConfigStore, FieldIssue};
use crate::error::RunError;
use crate::model::{CommandSpec, DisplayMode, JobEvent, RunKind, RunReport, TimeoutState};
use crate::phrases::{PhraseCategory, PhrasePicker};
use crate::sink::{NotifyLevel, OutputSink, SurfaceLayout};
use crate::supervisor::process::Spawner;
use crate::supervisor::{Completion, JobHandle, JobLimits, JobSupervisor, SupervisorState};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// What a run request turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStart {
    Started(JobHandle),
    /// Clean with no override and no `clean_command`.
    NothingConfigured,
}

/// Book-keeping for the run in flight. `config` is the snapshot taken at start.
struct ActiveRun {
    kind: RunKind,
    handle: JobHandle,
    command: String,
    config: Config,
}

pub struct Runner<S, P> {
    store: ConfigStore,
    sink: S,
    spawner: P,
    supervisor: JobSupervisor,
    phrases: PhrasePicker,
    active: Option<ActiveRun>,
}

impl<S: OutputSink, P: Spawner> Runner<S, P> {
    /// `events` must be the sender half of the queue the caller feeds back into
    /// [`Runner::handle_event`].
    pub fn new(
        store: ConfigStore,
        sink: S,
        spawner: P,
        phrases: PhrasePicker,
        events: UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            store,
            sink,
            spawner,
            supervisor: JobSupervisor::new(events),
            phrases,
            active: None,
        }
    }

    pub fn config(&self) -> &Config {
        self.store.get()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Supervisor state plus the watchdog stage of the live job, if any.
    pub fn job_state(&self) -> (SupervisorState, Option<TimeoutState>) {
        (self.supervisor.state(), self.supervisor.timeout_state())
    }

    pub fn status(&self) -> String {
        crate::status::status_line(self.store.get())
    }

    /// Forward a user-facing message to the sink's notification channel.
    pub fn notify(&mut self, message: &str, level: NotifyLevel) {
        self.sink.notify(message, level);
    }

    /// Runtime config update. Rejected fields are reported and left unchanged.
    pub fn update_config(&mut self, overrides: &ConfigOverrides) -> Vec<FieldIssue> {
        let issues = self.store.merge(overrides);
        for issue in &issues {
            self.sink.notify(
                &format!("config `{}`: {}", issue.field, issue.reason),
                NotifyLevel::Warn,
            );
        }
        issues
    }

    /// Resolve, announce and start a build or clean.
    pub fn run(
        &mut self,
        kind: RunKind,
        overriding: Option<CommandSpec>,
    ) -> Result<RunStart, RunError> {
        if self.supervisor.is_running() {
            tracing::warn!(?kind, "run rejected: a job is already running");
            self.sink
                .notify(&RunError::AlreadyRunning.to_string(), NotifyLevel::Warn);
            return Err(RunError::AlreadyRunning);
        }

        let cfg = self.store.snapshot();
        let Some(command) = resolve(kind, overriding.as_ref(), &cfg) else {
            self.sink.notify(
                &format!("No {} command configured", kind.noun().to_lowercase()),
                NotifyLevel::Warn,
            );
            return Ok(RunStart::NothingConfigured);
        };

        let project = cfg.project_name.as_deref().unwrap_or("project");
        self.sink.replace_all(vec![
            format!("{} {}", kind.action(), project),
            command.display.clone(),
        ]);
        if cfg.display_mode != DisplayMode::Never && !self.sink.is_surface_open() {
            self.sink.open_surface(SurfaceLayout {
                mode: cfg.display_mode,
                primary_size: cfg.display_primary_size,
                secondary_size: cfg.display_secondary_size,
                equalize: cfg.equalize_after_open,
            });
        }

        let limits = JobLimits::from_config(&cfg);
        let handle = match self
            .supervisor
            .spawn(&mut self.spawner, &command.argv, limits)
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(?kind, "run failed to start: {e}");
                self.sink.append(vec![format!("Failed to start: {e}")]);
                self.sink.notify(&e.to_string(), NotifyLevel::Error);
                return Err(e);
            }
        };
        tracing::info!(?kind, job = %handle.id(), pid = ?handle.pid(), command = %command.display, "run started");

        self.active = Some(ActiveRun {
            kind,
            handle,
            command: command.display,
            config: cfg,
        });
        Ok(RunStart::Started(handle))
    }

    /// Ask the running job to stop. `Ok(false)` means a stop is already in progress.
    pub fn stop(&mut self) -> Result<bool, RunError> {
        if !self.supervisor.is_running() {
            self.sink
                .notify(&RunError::NoJobRunning.to_string(), NotifyLevel::Warn);
            return Err(RunError::NoJobRunning);
        }
        Ok(self.supervisor.stop())
    }

    /// Feed one process/timer event. Returns the report once the run is over.
    pub fn handle_event(&mut self, event: JobEvent) -> Option<RunReport> {
        let completion = self.supervisor.handle_event(event, &mut self.sink)?;
        match self.active.take() {
            Some(active) if active.handle.id() == completion.job => {
                Some(self.finish(active, completion))
            }
            other => {
                tracing::debug!(job = %completion.job, "completion without a matching run");
                self.active = other;
                None
            }
        }
    }

    fn finish(&mut self, active: ActiveRun, completion: Completion) -> RunReport {
        let cfg = &active.config;
        let (category, icon, verb, list) = if completion.success {
            (
                PhraseCategory::Success,
                cfg.success_icon.as_deref(),
                "succeeded",
                &cfg.success_phrases,
            )
        } else {
            (
                PhraseCategory::Failure,
                cfg.fail_icon.as_deref(),
                "failed",
                &cfg.failure_phrases,
            )
        };

        let elapsed = Duration::from_millis(completion.elapsed.as_millis() as u64);
        let mut summary = format!(
            "{} {} (exit {}, {})",
            active.kind.noun(),
            verb,
            completion.exit_code,
            humantime::format_duration(elapsed)
        );
        if let Some(icon) = icon.filter(|i| !i.is_empty()) {
            summary = format!("{icon} {summary}");
        }
        let phrase = self.phrases.pick(category, list);

        let mut lines = vec![String::new(), summary.clone()];
        lines.extend(phrase.clone());
        self.sink.append(lines);

        if cfg.notify {
            let level = if completion.success {
                NotifyLevel::Info
            } else {
                NotifyLevel::Error
            };
            self.sink.notify(&summary, level);
        }
        if !completion.success {
            self.sink.jump_to_first_error();
        }

        RunReport {
            kind: active.kind,
            job: completion.job,
            command: active.command,
            exit_code: completion.exit_code,
            success: completion.success,
            outcome: completion.outcome,
            duration_ms: elapsed.as_millis() as u64,
            finished_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            phrase,
        }
    }
}
