//! Presentation surface for run output.
//!
//! The runner decides *when* a surface should be opened and what goes into it;
//! an [`OutputSink`] decides how that looks. [`TerminalSink`] is the stdout
//! implementation used by the binary.

use crate::model::DisplayMode;
use std::io::Write;
use tokio::sync::mpsc;

/// Where and how large the output surface should be when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub mode: DisplayMode,
    /// Lines, for horizontal placement.
    pub primary_size: u32,
    /// Columns, for vertical placement.
    pub secondary_size: u32,
    pub equalize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warn,
    Error,
}

pub trait OutputSink {
    fn is_surface_open(&self) -> bool;

    /// Create and size the surface. Only called while no surface is open.
    fn open_surface(&mut self, layout: SurfaceLayout);

    /// Replace the whole content.
    fn replace_all(&mut self, lines: Vec<String>);

    /// Append below the existing content.
    fn append(&mut self, lines: Vec<String>);

    /// Move the user to the first error entry, if the sink can find one.
    fn jump_to_first_error(&mut self) {}

    /// Out-of-band user notification.
    fn notify(&mut self, _message: &str, _level: NotifyLevel) {}
}

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Terminal rendition of the output list.
///
/// Content is always kept in `lines`; it only reaches stdout while the surface is
/// open, so `display_mode = never` collects output without printing it.
pub struct TerminalSink {
    tx: mpsc::UnboundedSender<OutputLine>,
    writer: tokio::task::JoinHandle<()>,
    open: bool,
    lines: Vec<String>,
    printed: usize,
}

impl TerminalSink {
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, writer) = spawn_output_writer();
        Self {
            tx,
            writer,
            open: false,
            lines: Vec::new(),
            printed: 0,
        }
    }

    /// Flush everything written so far and stop the writer.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }

    /// Print lines that arrived while the surface was closed, or since the last flush.
    fn flush_pending(&mut self) {
        if !self.open {
            return;
        }
        for line in &self.lines[self.printed..] {
            let _ = self.tx.send(OutputLine::Stdout(line.clone()));
        }
        self.printed = self.lines.len();
    }
}

impl OutputSink for TerminalSink {
    fn is_surface_open(&self) -> bool {
        self.open
    }

    fn open_surface(&mut self, layout: SurfaceLayout) {
        if layout.mode == DisplayMode::Never {
            return;
        }
        tracing::debug!(?layout, "opening terminal surface");
        self.open = true;
        self.flush_pending();
    }

    fn replace_all(&mut self, lines: Vec<String>) {
        if self.open && self.printed > 0 {
            // A terminal cannot erase scrollback; mark the boundary instead.
            let _ = self.tx.send(OutputLine::Stdout(String::new()));
        }
        self.lines = lines;
        self.printed = 0;
        self.flush_pending();
    }

    fn append(&mut self, lines: Vec<String>) {
        self.lines.extend(lines);
        self.flush_pending();
    }

    fn jump_to_first_error(&mut self) {
        if let Some(line) = first_error_index(&self.lines).map(|i| &self.lines[i]) {
            let _ = self
                .tx
                .send(OutputLine::Stderr(format!("First error: {line}")));
        }
    }

    fn notify(&mut self, message: &str, level: NotifyLevel) {
        let prefix = match level {
            NotifyLevel::Info => "",
            NotifyLevel::Warn => "warning: ",
            NotifyLevel::Error => "error: ",
        };
        let _ = self.tx.send(OutputLine::Stderr(format!("{prefix}{message}")));
    }
}

/// Index of the first line that looks like a compiler diagnostic.
///
/// Recognizes `path:line:` locations first, then any line mentioning "error".
pub fn first_error_index(lines: &[String]) -> Option<usize> {
    lines
        .iter()
        .position(|l| has_location(l))
        .or_else(|| {
            lines
                .iter()
                .position(|l| l.to_ascii_lowercase().contains("error"))
        })
}

fn has_location(line: &str) -> bool {
    let mut parts = line.splitn(3, ':');
    let (Some(path), Some(line_no), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !path.trim().is_empty()
        && !path.contains(' ')
        && !line_no.is_empty()
        && line_no.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum SinkCall {
        Open(SurfaceLayout),
        ReplaceAll(Vec<String>),
        Append(Vec<String>),
        JumpToFirstError,
        Notify(String, NotifyLevel),
    }

    /// Records every interaction, in order.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub open: bool,
        pub calls: Vec<SinkCall>,
    }

    impl RecordingSink {
        pub(crate) fn appended(&self) -> Vec<String> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    SinkCall::Append(lines) => Some(lines.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        pub(crate) fn opens(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, SinkCall::Open(_)))
                .count()
        }

        pub(crate) fn notifications(&self) -> Vec<(String, NotifyLevel)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    SinkCall::Notify(m, l) => Some((m.clone(), *l)),
                    _ => None,
                })
                .collect()
        }
    }

    impl OutputSink for RecordingSink {
        fn is_surface_open(&self) -> bool {
            self.open
        }
        fn open_surface(&mut self, layout: SurfaceLayout) {
            self.open = layout.mode != DisplayMode::Never;
            self.calls.push(SinkCall::Open(layout));
        }
        fn replace_all(&mut self, lines: Vec<String>) {
            self.calls.push(SinkCall::ReplaceAll(lines));
        }
        fn append(&mut self, lines: Vec<String>) {
            self.calls.push(SinkCall::Append(lines));
        }
        fn jump_to_first_error(&mut self) {
            self.calls.push(SinkCall::JumpToFirstError);
        }
        fn notify(&mut self, message: &str, level: NotifyLevel) {
            self.calls.push(SinkCall::Notify(message.to_string(), level));
        }
    }
}
