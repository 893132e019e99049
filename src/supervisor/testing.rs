//! Scriptable stand-ins for a real process.

use super::process::{ProcessControl, Spawner};
use crate::model::{JobEvent, JobId};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivered {
    SoftStop,
    Signal(i32),
}

/// Shared record of every control request, with the (paused-clock) time it arrived.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeliveryLog(Arc<Mutex<Vec<(Instant, Delivered)>>>);

impl DeliveryLog {
    fn push(&self, d: Delivered) {
        self.0.lock().unwrap().push((Instant::now(), d));
    }

    pub(crate) fn kinds(&self) -> Vec<Delivered> {
        self.0.lock().unwrap().iter().map(|(_, d)| *d).collect()
    }

    pub(crate) fn times_since(&self, start: Instant) -> Vec<(Duration, Delivered)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|(t, d)| (t.duration_since(start), *d))
            .collect()
    }
}

/// How a fake process reacts to control requests.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    /// Exit this long after a soft-stop; `None` ignores soft-stops.
    pub exit_after_soft_stop: Option<Duration>,
    /// Exit immediately when a hard-kill signal arrives.
    pub exit_on_signal: bool,
    /// Make signal delivery fail as if the process were already gone.
    pub signals_fail: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FakeSpawner {
    pub behavior: FakeBehavior,
    pub log: DeliveryLog,
    pub spawn_error: Option<io::ErrorKind>,
    pub spawned: Vec<Vec<String>>,
    /// Sender of the most recent job, for scripting output and exits.
    pub last: Option<(JobId, UnboundedSender<JobEvent>)>,
}

impl FakeSpawner {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    pub(crate) fn emit(&self, event: impl FnOnce(JobId) -> JobEvent) {
        let (job, tx) = self.last.as_ref().expect("nothing spawned");
        tx.send(event(*job)).expect("event channel open");
    }
}

impl Spawner for FakeSpawner {
    fn spawn(
        &mut self,
        job: JobId,
        argv: &[String],
        events: UnboundedSender<JobEvent>,
    ) -> io::Result<Box<dyn ProcessControl>> {
        if let Some(kind) = self.spawn_error {
            return Err(io::Error::new(kind, "fake spawn failure"));
        }
        self.spawned.push(argv.to_vec());
        self.last = Some((job, events.clone()));
        Ok(Box::new(FakeProcess {
            job,
            events,
            behavior: self.behavior.clone(),
            log: self.log.clone(),
        }))
    }
}

struct FakeProcess {
    job: JobId,
    events: UnboundedSender<JobEvent>,
    behavior: FakeBehavior,
    log: DeliveryLog,
}

impl ProcessControl for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn soft_stop(&mut self) -> io::Result<()> {
        self.log.push(Delivered::SoftStop);
        if let Some(after) = self.behavior.exit_after_soft_stop {
            let (job, events) = (self.job, self.events.clone());
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = events.send(JobEvent::Exit { job, code: 143 });
            });
        }
        Ok(())
    }

    fn signal(&mut self, signal: i32) -> io::Result<()> {
        self.log.push(Delivered::Signal(signal));
        if self.behavior.signals_fail {
            return Err(io::Error::from_raw_os_error(3));
        }
        if self.behavior.exit_on_signal {
            let _ = self.events.send(JobEvent::Exit {
                job: self.job,
                code: 128 + signal,
            });
        }
        Ok(())
    }
}
