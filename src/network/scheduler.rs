use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};

/// Shortest period a repeating task runs at
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A single cancellable, reschedulable timer slot.
///
/// Each scheduling gets a fresh token which is handed to the callback. A
/// firing can already be queued when the slot is cancelled or replaced, so
/// the owner checks [`ScheduledTask::is_current`] before acting on it.
#[derive(Debug)]
pub struct ScheduledTask {
    label: &'static str,
    handle: Option<JoinHandle<()>>,
    active_token: Option<u64>,
    last_token: u64,
}

impl ScheduledTask {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handle: None,
            active_token: None,
            last_token: 0,
        }
    }

    fn next_token(&mut self) -> u64 {
        self.last_token += 1;
        self.last_token
    }

    /// Fire `callback` once after `delay`, replacing anything already scheduled
    pub fn schedule_once<F>(&mut self, delay: Duration, callback: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let token = self.next_token();
        trace!(task = self.label, token, ?delay, "Scheduling single-shot task");
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(token);
        }));
        self.active_token = Some(token);
        token
    }

    /// Fire `callback` every `interval`, first firing one interval from now.
    /// A zero interval is raised to one millisecond.
    pub fn schedule_repeating<F>(&mut self, interval: Duration, mut callback: F) -> u64
    where
        F: FnMut(u64) + Send + 'static,
    {
        let interval = if interval < MIN_PERIOD {
            warn!(task = self.label, ?interval, "Repeating interval too short; using 1ms");
            MIN_PERIOD
        } else {
            interval
        };
        self.cancel();
        let token = self.next_token();
        trace!(task = self.label, token, ?interval, "Scheduling repeating task");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback(token);
            }
        }));
        self.active_token = Some(token);
        token
    }

    /// Idempotent. Returns whether something was actually scheduled.
    pub fn cancel(&mut self) -> bool {
        self.active_token = None;
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                trace!(task = self.label, "Cancelled scheduled task");
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.active_token == Some(token)
    }

    /// Retire a single-shot firing. Returns false for stale tokens.
    pub fn complete(&mut self, token: u64) -> bool {
        if !self.is_current(token) {
            return false;
        }
        self.active_token = None;
        self.handle = None;
        true
    }

    pub fn is_scheduled(&self) -> bool {
        self.active_token.is_some()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = ScheduledTask::new("test");
        let token = task.schedule_once(Duration::from_secs(5), move |t| {
            let _ = tx.send(t);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(token));
        assert!(task.complete(token));
        assert!(!task.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut task = ScheduledTask::new("test");
        task.schedule_once(Duration::from_secs(1), move |t| {
            let _ = tx.send(t);
        });

        assert!(task.cancel());
        assert!(!task.cancel());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_invalidates_previous_token() {
        let mut task = ScheduledTask::new("test");
        let first = task.schedule_once(Duration::from_secs(1), |_| {});
        let second = task.schedule_once(Duration::from_secs(1), |_| {});

        assert_ne!(first, second);
        assert!(!task.is_current(first));
        assert!(task.is_current(second));
        assert!(!task.complete(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_keeps_firing_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = ScheduledTask::new("heartbeat");
        let token = task.schedule_repeating(Duration::from_secs(1), move |t| {
            let _ = tx.send(t);
        });

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(token));
        }
        task.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = ScheduledTask::new("heartbeat");
        let token = task.schedule_repeating(Duration::ZERO, move |t| {
            let _ = tx.send(t);
        });

        assert_eq!(rx.recv().await, Some(token));
        assert_eq!(rx.recv().await, Some(token));
        assert!(task.is_scheduled());
        task.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        {
            let mut task = ScheduledTask::new("test");
            task.schedule_once(Duration::from_secs(1), move |t| {
                let _ = tx.send(t);
            });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.recv().await.is_none());
    }
}
