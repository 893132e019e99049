//! Process spawning and signal delivery.
//!
//! A spawned process reports back only through [`JobEvent`]s: output chunks from
//! both pipes, then exactly one `Exit` once the process has been reaped and its
//! pipes drained.

use super::lines::{split_chunk, Utf8Decoder};
use crate::model::{JobEvent, JobId, StreamKind};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long to keep draining pipes after the process exits. A grandchild that
/// inherited stdout could otherwise hold the `Exit` event back forever.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Control over one live process. Owned exclusively by the supervisor.
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Cooperative termination request; the process may ignore it.
    fn soft_stop(&mut self) -> io::Result<()>;

    /// Deliver `signal` directly to the process.
    fn signal(&mut self, signal: i32) -> io::Result<()>;
}

/// Starts processes for the supervisor.
pub trait Spawner {
    fn spawn(
        &mut self,
        job: JobId,
        argv: &[String],
        events: UnboundedSender<JobEvent>,
    ) -> io::Result<Box<dyn ProcessControl>>;
}

/// Spawns real OS processes on the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
    cwd: Option<PathBuf>,
}

impl TokioSpawner {
    pub fn new(cwd: Option<PathBuf>) -> Self {
        Self { cwd }
    }
}

impl Spawner for TokioSpawner {
    fn spawn(
        &mut self,
        job: JobId,
        argv: &[String],
        events: UnboundedSender<JobEvent>,
    ) -> io::Result<Box<dyn ProcessControl>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = self.cwd.as_ref() {
            command.current_dir(cwd);
        }
        // Own process group, so signals reach everything a shell wrapper started
        // and a terminal Ctrl-C is routed through `stop()` instead.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        tracing::info!(%job, ?pid, program = %program, "process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let reaped = Arc::new(AtomicBool::new(false));
        let reaped_by_waiter = reaped.clone();
        #[cfg(not(unix))]
        let (kill_tx, mut kill_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let readers: Vec<_> = [
                stdout.map(|s| spawn_reader(s, job, StreamKind::Stdout, events.clone())),
                stderr.map(|s| spawn_reader(s, job, StreamKind::Stderr, events.clone())),
            ]
            .into_iter()
            .flatten()
            .collect();

            #[cfg(unix)]
            let status = child.wait().await;
            #[cfg(not(unix))]
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            };
            // The pid may be reused from here on; no more signals to it.
            reaped_by_waiter.store(true, Ordering::SeqCst);

            for mut reader in readers {
                if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    tracing::debug!(%job, "pipe still open after exit; abandoning reader");
                    reader.abort();
                }
            }

            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(%job, "failed to wait for process: {e}");
                    -1
                }
            };
            let _ = events.send(JobEvent::Exit { job, code });
        });

        Ok(Box::new(TokioProcess {
            pid,
            reaped,
            #[cfg(not(unix))]
            kill_tx,
        }))
    }
}

fn spawn_reader<R>(
    mut pipe: R,
    job: JobId,
    stream: StreamKind,
    events: UnboundedSender<JobEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8Decoder::new();
        let send = |text: &str| {
            events
                .send(JobEvent::OutputChunk {
                    job,
                    stream,
                    data: split_chunk(text),
                })
                .is_ok()
        };
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    // Only the start of a multi-byte character so far.
                    if text.is_empty() {
                        continue;
                    }
                    if !send(&text) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(%job, ?stream, "read failed: {e}");
                    break;
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            send(&rest);
        }
    })
}

/// Exit code, with signal deaths mapped to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

struct TokioProcess {
    pid: Option<u32>,
    /// Set by the wait task once the process has been reaped.
    reaped: Arc<AtomicBool>,
    #[cfg(not(unix))]
    kill_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

#[cfg(unix)]
impl TokioProcess {
    fn kill_group(&self, signal: i32) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
        if self.reaped.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        // Negative pid addresses the whole process group.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl ProcessControl for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn soft_stop(&mut self) -> io::Result<()> {
        self.kill_group(libc::SIGTERM)
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: i32) -> io::Result<()> {
        self.kill_group(signal)
    }

    #[cfg(not(unix))]
    fn soft_stop(&mut self) -> io::Result<()> {
        self.kill_tx
            .send(())
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "process already exited"))
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: i32) -> io::Result<()> {
        self.soft_stop()
    }
}
