//! Run control: stop/pause/resume and the hourly call budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// Requested state of an in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Paused,
    Stopping,
}

/// Cloneable handle for steering a run from another task.
///
/// Stopping only prevents new attempts from starting; attempts already in
/// flight finish and are recorded.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: Arc<watch::Sender<RunControl>>,
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunControl::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(RunControl::Stopping);
    }

    /// Pause before the next attempt. A stop overrides a pause.
    pub fn pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == RunControl::Running {
                *state = RunControl::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|state| {
            if *state == RunControl::Paused {
                *state = RunControl::Running;
                true
            } else {
                false
            }
        });
    }

    #[must_use]
    pub fn state(&self) -> RunControl {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == RunControl::Stopping
    }

    /// Block while paused. Returns `false` once a stop has been requested.
    pub async fn proceed(&self) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                RunControl::Running => return true,
                RunControl::Stopping => return false,
                RunControl::Paused => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Resolve when a stop is requested.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this never errors.
        let _ = rx.wait_for(|state| *state == RunControl::Stopping).await;
    }
}

/// Sliding-window limit on agent invocations.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    /// `max_calls` per hour; 0 disables the limit.
    #[must_use]
    pub fn per_hour(max_calls: u32) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(3600),
            calls: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn record(&mut self, at: Instant) {
        if self.max_calls > 0 {
            self.calls.push_back(at);
        }
    }

    /// How long to wait at `now` before the next call fits in the window.
    pub fn delay(&mut self, now: Instant) -> Option<Duration> {
        if self.max_calls == 0 {
            return None;
        }
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.calls.len() < self.max_calls as usize {
            return None;
        }
        self.calls
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
    }

    /// Sleep until a call fits, waking early if `handle` is stopped.
    pub async fn wait(&mut self, handle: &LoopHandle) {
        let Some(delay) = self.delay(Instant::now()) else {
            return;
        };
        info!(
            wait_secs = delay.as_secs(),
            max_calls_per_hour = self.max_calls,
            "call budget exhausted, waiting"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = handle.stopped() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::per_hour(2).with_window(Duration::from_secs(10));
        assert_eq!(limiter.delay(start), None);
        limiter.record(start);
        limiter.record(start + Duration::from_secs(2));

        assert_eq!(
            limiter.delay(start + Duration::from_secs(4)),
            Some(Duration::from_secs(6))
        );
        // the first call has left the window
        assert_eq!(limiter.delay(start + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_unlimited_never_waits() {
        let now = Instant::now();
        let mut limiter = RateLimiter::per_hour(0);
        for _ in 0..100 {
            limiter.record(now);
        }
        assert_eq!(limiter.delay(now), None);
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let handle = LoopHandle::new();
        assert!(handle.proceed().await);

        handle.pause();
        assert_eq!(handle.state(), RunControl::Paused);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.proceed().await })
        };
        tokio::task::yield_now().await;
        handle.resume();
        assert!(waiter.await.unwrap());

        handle.stop();
        handle.resume();
        assert!(handle.is_stopped());
        assert!(!handle.proceed().await);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_stop() {
        let handle = LoopHandle::new();
        let mut limiter = RateLimiter::per_hour(1);
        limiter.record(Instant::now());

        let stopper = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });
        let before = Instant::now();
        limiter.wait(&handle).await;
        assert!(before.elapsed() < Duration::from_secs(30));
    }
}
