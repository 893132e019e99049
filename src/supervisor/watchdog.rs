//! One-shot timers that post a [`JobEvent`] back into the supervisor's queue.

use crate::model::JobEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// A cancelable timer. Cancelling an idle, fired, or already-cancelled timer is a no-op.
///
/// An event that was already queued before `cancel` is not recalled; the
/// supervisor drops it by checking job id and timeout state.
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Must be called from within a tokio runtime.
    pub fn arm(after: Duration, events: UnboundedSender<JobEvent>, event: JobEvent) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the handle of a timer whose event has been delivered.
    pub fn mark_fired(&mut self) {
        self.handle = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, WatchdogStage};

    fn event() -> JobEvent {
        JobEvent::Watchdog {
            job: JobId(1),
            stage: WatchdogStage::Timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();
        let mut timer = Timer::arm(Duration::from_millis(250), tx, event());
        assert!(timer.is_armed());
        assert_eq!(rx.recv().await, Some(event()));
        assert!(start.elapsed() >= Duration::from_millis(250));
        timer.mark_fired();
        assert!(!timer.is_armed());
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut timer = Timer::arm(Duration::from_millis(100), tx, event());
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        // The aborted task dropped its sender, so the channel is closed and empty.
        assert_eq!(rx.recv().await, None);
    }
}
