//! Lifecycle of the single external process.
//!
//! [`JobSupervisor`] owns at most one live job. Everything that happens to it
//! (output, exit, watchdog timers) arrives as a [`JobEvent`] through
//! [`JobSupervisor::handle_event`], so all state transitions live in one place
//! and can be driven without a real process.
//!
//! Timeout escalation: with `timeout_seconds > 0` the job starts `Armed`; when the
//! timeout fires it moves to `SoftStopIssued` and the kill-grace timer starts; if
//! that fires before the exit it moves to `HardKillIssued` and the hard-kill
//! signal goes straight to the process. A manual [`JobSupervisor::stop`] enters
//! the same path at `SoftStopIssued`, so each stage happens at most once.

mod lines;
pub mod process;
#[cfg(test)]
pub(crate) mod testing;
mod watchdog;

pub use lines::LineAssembler;

use crate::config::Config;
use crate::error::RunError;
use crate::model::{JobEvent, JobId, JobOutcome, StreamKind, TimeoutState, WatchdogStage};
use crate::sink::OutputSink;
use process::{ProcessControl, Spawner};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use watchdog::Timer;

/// Timing and signal settings copied from the config when a job starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    /// `None` disables the watchdog.
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub hard_kill_signal: i32,
}

impl JobLimits {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: (cfg.timeout_seconds > 0).then(|| Duration::from_secs(cfg.timeout_seconds)),
            kill_grace: Duration::from_millis(cfg.kill_grace_ms),
            hard_kill_signal: cfg.hard_kill_signal,
        }
    }
}

/// Opaque reference to a started job. It grants no access to the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    id: JobId,
    pid: Option<u32>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Finished(JobOutcome),
}

/// Terminal report for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub job: JobId,
    pub exit_code: i32,
    pub success: bool,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

struct Job {
    id: JobId,
    process: Box<dyn ProcessControl>,
    limits: JobLimits,
    timeout_state: TimeoutState,
    started: Instant,
    stdout: LineAssembler,
    stderr: LineAssembler,
    timeout_timer: Timer,
    grace_timer: Timer,
    events: UnboundedSender<JobEvent>,
}

impl Job {
    /// Issue the soft-stop and start the kill-grace countdown. Only valid once per job.
    fn soft_stop(&mut self) {
        self.timeout_timer.cancel();
        self.timeout_state = TimeoutState::SoftStopIssued;
        if let Err(e) = self.process.soft_stop() {
            tracing::warn!(job = %self.id, "soft-stop failed, treating process as terminated: {e}");
        }
        self.grace_timer = Timer::arm(
            self.limits.kill_grace,
            self.events.clone(),
            JobEvent::Watchdog {
                job: self.id,
                stage: WatchdogStage::KillGrace,
            },
        );
    }

    fn hard_kill(&mut self) {
        self.timeout_state = TimeoutState::HardKillIssued;
        let signal = self.limits.hard_kill_signal;
        tracing::warn!(job = %self.id, signal, "process ignored soft-stop; sending hard-kill");
        if let Err(e) = self.process.signal(signal) {
            tracing::warn!(job = %self.id, "hard-kill failed, treating process as terminated: {e}");
        }
    }

    fn assembler(&mut self, stream: StreamKind) -> &mut LineAssembler {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}

pub struct JobSupervisor {
    state: SupervisorState,
    job: Option<Job>,
    events: UnboundedSender<JobEvent>,
    next_id: u64,
}

impl JobSupervisor {
    /// `events` is the queue every process and timer of this supervisor reports into.
    pub fn new(events: UnboundedSender<JobEvent>) -> Self {
        Self {
            state: SupervisorState::Idle,
            job: None,
            events,
            next_id: 1,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    pub fn timeout_state(&self) -> Option<TimeoutState> {
        self.job.as_ref().map(|j| j.timeout_state)
    }

    /// Start `argv`. Failures are reported here, never later through the event stream.
    pub fn spawn<S: Spawner + ?Sized>(
        &mut self,
        spawner: &mut S,
        argv: &[String],
        limits: JobLimits,
    ) -> Result<JobHandle, RunError> {
        if self.job.is_some() {
            return Err(RunError::AlreadyRunning);
        }
        let program = match argv.first() {
            Some(p) if !p.is_empty() => p.clone(),
            _ => return Err(RunError::InvalidCommand),
        };

        let id = JobId(self.next_id);
        self.next_id += 1;
        let process = spawner
            .spawn(id, argv, self.events.clone())
            .map_err(|source| RunError::SpawnFailure { program, source })?;
        let pid = process.pid();

        let (timeout_state, timeout_timer) = match limits.timeout {
            Some(after) => (
                TimeoutState::Armed,
                Timer::arm(
                    after,
                    self.events.clone(),
                    JobEvent::Watchdog {
                        job: id,
                        stage: WatchdogStage::Timeout,
                    },
                ),
            ),
            None => (TimeoutState::None, Timer::idle()),
        };

        self.job = Some(Job {
            id,
            process,
            limits,
            timeout_state,
            started: Instant::now(),
            stdout: LineAssembler::new(),
            stderr: LineAssembler::new(),
            timeout_timer,
            grace_timer: Timer::idle(),
            events: self.events.clone(),
        });
        self.state = SupervisorState::Running;
        tracing::debug!(job = %id, ?timeout_state, "job running");
        Ok(JobHandle { id, pid })
    }

    /// Request a graceful stop. Returns `false` when nothing is running or a stop
    /// (manual or timeout-driven) was already issued for this job.
    pub fn stop(&mut self) -> bool {
        let Some(job) = self.job.as_mut() else {
            return false;
        };
        match job.timeout_state {
            TimeoutState::SoftStopIssued | TimeoutState::HardKillIssued | TimeoutState::Finished => {
                false
            }
            TimeoutState::None | TimeoutState::Armed => {
                tracing::info!(job = %job.id, "stop requested");
                job.soft_stop();
                true
            }
        }
    }

    /// Single entry point for process and timer events. Returns the completion
    /// when the event ended the job. Events for any other job are ignored.
    pub fn handle_event(
        &mut self,
        event: JobEvent,
        sink: &mut dyn OutputSink,
    ) -> Option<Completion> {
        if self.job.as_ref().map(|j| j.id) != Some(event.job()) {
            tracing::debug!(job = %event.job(), "ignoring event for a job that is not live");
            return None;
        }
        match event {
            JobEvent::OutputChunk { stream, data, .. } => {
                self.on_output_chunk(stream, data, sink);
                None
            }
            JobEvent::Watchdog { stage, .. } => {
                self.on_watchdog(stage);
                None
            }
            JobEvent::Exit { code, .. } => self.on_exit(code, sink),
        }
    }

    fn on_output_chunk(&mut self, stream: StreamKind, data: Vec<String>, sink: &mut dyn OutputSink) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        let lines = job.assembler(stream).feed(data);
        if !lines.is_empty() {
            sink.append(lines);
        }
    }

    fn on_watchdog(&mut self, stage: WatchdogStage) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        match (stage, job.timeout_state) {
            (WatchdogStage::Timeout, TimeoutState::Armed) => {
                job.timeout_timer.mark_fired();
                tracing::warn!(job = %job.id, timeout = ?job.limits.timeout, "job timed out; sending soft-stop");
                job.soft_stop();
            }
            (WatchdogStage::KillGrace, TimeoutState::SoftStopIssued) => {
                job.grace_timer.mark_fired();
                job.hard_kill();
            }
            (stage, state) => {
                tracing::debug!(job = %job.id, ?stage, ?state, "stale watchdog event");
            }
        }
    }

    fn on_exit(&mut self, code: i32, sink: &mut dyn OutputSink) -> Option<Completion> {
        let mut job = self.job.take()?;
        job.timeout_timer.cancel();
        job.grace_timer.cancel();

        let tail: Vec<String> = [job.stdout.finish(), job.stderr.finish()]
            .into_iter()
            .flatten()
            .collect();
        if !tail.is_empty() {
            sink.append(tail);
        }

        let outcome = match job.timeout_state {
            TimeoutState::SoftStopIssued | TimeoutState::HardKillIssued => JobOutcome::Killed,
            _ => JobOutcome::Completed,
        };
        job.timeout_state = TimeoutState::Finished;
        self.state = SupervisorState::Finished(outcome);

        let completion = Completion {
            job: job.id,
            exit_code: code,
            success: code == 0,
            outcome,
            elapsed: job.started.elapsed(),
        };
        tracing::info!(job = %job.id, code, ?outcome, "job finished");
        Some(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Delivered, FakeBehavior, FakeSpawner};
    use super::*;
    use crate::sink::testing::RecordingSink;
    use tokio::sync::mpsc;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn limits(timeout_ms: Option<u64>, grace_ms: u64) -> JobLimits {
        JobLimits {
            timeout: timeout_ms.map(Duration::from_millis),
            kill_grace: Duration::from_millis(grace_ms),
            hard_kill_signal: 9,
        }
    }

    /// Feed queued events to the supervisor until the job completes.
    async fn drive(
        sup: &mut JobSupervisor,
        rx: &mut mpsc::UnboundedReceiver<JobEvent>,
        sink: &mut RecordingSink,
    ) -> Completion {
        loop {
            let ev = rx.recv().await.expect("event channel open");
            if let Some(done) = sup.handle_event(ev, sink) {
                return done;
            }
        }
    }

    #[tokio::test]
    async fn empty_argv_is_invalid() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::default();
        assert!(matches!(
            sup.spawn(&mut spawner, &[], limits(None, 100)),
            Err(RunError::InvalidCommand)
        ));
        assert!(matches!(
            sup.spawn(&mut spawner, &argv(&[""]), limits(None, 100)),
            Err(RunError::InvalidCommand)
        ));
        assert!(spawner.spawned.is_empty());
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner {
            spawn_error: Some(std::io::ErrorKind::PermissionDenied),
            ..FakeSpawner::default()
        };
        match sup.spawn(&mut spawner, &argv(&["make"]), limits(None, 100)) {
            Err(RunError::SpawnFailure { program, source }) => {
                assert_eq!(program, "make");
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn second_spawn_is_rejected_while_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::default();
        sup.spawn(&mut spawner, &argv(&["make"]), limits(None, 100))
            .expect("first spawn");
        assert!(matches!(
            sup.spawn(&mut spawner, &argv(&["make"]), limits(None, 100)),
            Err(RunError::AlreadyRunning)
        ));
        assert_eq!(spawner.spawned.len(), 1);
    }

    #[tokio::test]
    async fn chunks_are_reassembled_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::default();
        let mut sink = RecordingSink::default();
        sup.spawn(&mut spawner, &argv(&["make"]), limits(None, 100))
            .expect("spawn");

        let chunk = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        spawner.emit(|job| JobEvent::OutputChunk {
            job,
            stream: StreamKind::Stdout,
            data: chunk(&["line1", "line2", ""]),
        });
        spawner.emit(|job| JobEvent::OutputChunk {
            job,
            stream: StreamKind::Stdout,
            data: chunk(&[""]),
        });
        spawner.emit(|job| JobEvent::OutputChunk {
            job,
            stream: StreamKind::Stderr,
            data: chunk(&["warn"]),
        });
        spawner.emit(|job| JobEvent::OutputChunk {
            job,
            stream: StreamKind::Stdout,
            data: chunk(&["line3", ""]),
        });
        spawner.emit(|job| JobEvent::Exit { job, code: 0 });

        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert!(done.success);
        assert_eq!(done.outcome, JobOutcome::Completed);
        use crate::sink::testing::SinkCall;
        assert_eq!(
            sink.calls,
            vec![
                SinkCall::Append(chunk(&["line1", "line2"])),
                SinkCall::Append(chunk(&["line3"])),
                SinkCall::Append(chunk(&["warn"])),
            ]
        );
        assert_eq!(sup.state(), SupervisorState::Finished(JobOutcome::Completed));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::new(FakeBehavior {
            exit_after_soft_stop: Some(Duration::from_millis(1)),
            ..FakeBehavior::default()
        });
        let mut sink = RecordingSink::default();
        assert!(!sup.stop());

        sup.spawn(&mut spawner, &argv(&["make"]), limits(None, 60_000))
            .expect("spawn");
        assert!(sup.stop());
        assert!(!sup.stop());
        assert_eq!(spawner.log.kinds(), vec![Delivered::SoftStop]);

        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert_eq!(done.outcome, JobOutcome::Killed);
        assert!(!done.success);
        assert!(!sup.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_escalates_to_hard_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::new(FakeBehavior {
            exit_on_signal: true,
            ..FakeBehavior::default()
        });
        let mut sink = RecordingSink::default();
        let start = Instant::now();
        sup.spawn(&mut spawner, &argv(&["hang"]), limits(Some(1000), 100))
            .expect("spawn");
        assert_eq!(sup.timeout_state(), Some(TimeoutState::Armed));

        let done = drive(&mut sup, &mut rx, &mut sink).await;
        let log = spawner.log.times_since(start);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].1, Delivered::SoftStop);
        assert!(log[0].0 >= Duration::from_millis(1000) && log[0].0 < Duration::from_millis(1050));
        assert_eq!(log[1].1, Delivered::Signal(9));
        assert!(log[1].0 >= Duration::from_millis(1100) && log[1].0 < Duration::from_millis(1150));
        assert_eq!(done.exit_code, 137);
        assert_eq!(done.outcome, JobOutcome::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_within_grace_skips_hard_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::new(FakeBehavior {
            exit_after_soft_stop: Some(Duration::from_millis(50)),
            ..FakeBehavior::default()
        });
        let mut sink = RecordingSink::default();
        sup.spawn(&mut spawner, &argv(&["slow"]), limits(Some(1000), 100))
            .expect("spawn");

        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert_eq!(done.exit_code, 143);
        assert_eq!(spawner.log.kinds(), vec![Delivered::SoftStop]);

        // Let the cancelled grace deadline pass; nothing more may be delivered.
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(ev) = rx.try_recv() {
            assert!(sup.handle_event(ev, &mut sink).is_none());
        }
        assert_eq!(spawner.log.kinds(), vec![Delivered::SoftStop]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_during_armed_watchdog_kills_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx);
        let mut spawner = FakeSpawner::new(FakeBehavior {
            exit_on_signal: true,
            ..FakeBehavior::default()
        });
        let mut sink = RecordingSink::default();
        sup.spawn(&mut spawner, &argv(&["hang"]), limits(Some(1000), 100))
            .expect("spawn");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.stop());
        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert_eq!(
            spawner.log.kinds(),
            vec![Delivered::SoftStop, Delivered::Signal(9)]
        );
        assert_eq!(done.outcome, JobOutcome::Killed);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_hard_kill_is_not_fatal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx.clone());
        let mut spawner = FakeSpawner::new(FakeBehavior {
            signals_fail: true,
            ..FakeBehavior::default()
        });
        let mut sink = RecordingSink::default();
        let handle = sup
            .spawn(&mut spawner, &argv(&["zombie"]), limits(Some(10), 10))
            .expect("spawn");

        // Deliver both watchdog stages, then the exit the OS eventually reports.
        for _ in 0..2 {
            let ev = rx.recv().await.expect("watchdog");
            assert!(sup.handle_event(ev, &mut sink).is_none());
        }
        assert_eq!(sup.timeout_state(), Some(TimeoutState::HardKillIssued));
        tx.send(JobEvent::Exit {
            job: handle.id(),
            code: 137,
        })
        .unwrap();
        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert_eq!(done.outcome, JobOutcome::Killed);
    }

    #[tokio::test]
    async fn duplicate_and_stale_exits_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sup = JobSupervisor::new(tx.clone());
        let mut spawner = FakeSpawner::default();
        let mut sink = RecordingSink::default();
        let handle = sup
            .spawn(&mut spawner, &argv(&["make"]), limits(None, 100))
            .expect("spawn");

        spawner.emit(|job| JobEvent::OutputChunk {
            job,
            stream: StreamKind::Stdout,
            data: vec!["partial tail".into()],
        });
        spawner.emit(|job| JobEvent::Exit { job, code: 2 });
        let done = drive(&mut sup, &mut rx, &mut sink).await;
        assert_eq!(done.exit_code, 2);
        assert!(!done.success);
        assert_eq!(sink.appended(), vec!["partial tail".to_string()]);

        let again = JobEvent::Exit {
            job: handle.id(),
            code: 0,
        };
        assert!(sup.handle_event(again, &mut sink).is_none());
        assert!(sup
            .handle_event(
                JobEvent::Exit {
                    job: JobId(99),
                    code: 0
                },
                &mut sink
            )
            .is_none());
        assert_eq!(sup.state(), SupervisorState::Finished(JobOutcome::Completed));

        // The supervisor stays usable for the next run.
        let next = sup
            .spawn(&mut spawner, &argv(&["make"]), limits(None, 100))
            .expect("next spawn");
        assert_ne!(next.id(), handle.id());
    }
}
