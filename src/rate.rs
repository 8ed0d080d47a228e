//! Sliding-window rate limiting.
//!
//! A [`RateLimiter`] composes one or more [`RateWindow`]s (e.g. 2 per 10s
//! *and* 50 per hour). A request is admitted only when every window has
//! capacity, and admission records the timestamp in every window atomically:
//! if any window refuses, none is updated.
//!
//! Uses `tokio::time::Instant` so paused-clock tests can drive the windows
//! deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// A single window: at most `max_requests` admission timestamps within
/// `duration` of now.
#[derive(Debug)]
struct RateWindow {
    duration: Duration,
    max_requests: usize,
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            duration: Duration::from_secs(config.duration),
            max_requests: config.max_requests,
            timestamps: VecDeque::with_capacity(config.max_requests),
        }
    }

    /// Drop timestamps older than the window.
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) > self.duration {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn would_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max_requests
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    /// When the oldest remaining admission falls out of the window.
    fn next_available(&self, now: Instant) -> Option<Duration> {
        if self.timestamps.len() < self.max_requests {
            return None;
        }
        self.timestamps
            .front()
            .map(|oldest| (*oldest + self.duration).saturating_duration_since(now))
    }
}

/// Multi-window limiter. All windows must admit; recording is all-or-nothing
/// under a single critical section.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Vec<RateWindow>>,
}

impl RateLimiter {
    pub fn new(configs: &[RateLimitConfig]) -> Self {
        Self {
            windows: Mutex::new(configs.iter().map(RateWindow::new).collect()),
        }
    }

    /// A limiter with no windows; admits everything.
    pub fn unlimited() -> Self {
        Self::new(&[])
    }

    /// Check admission and record in every window atomically.
    ///
    /// On refusal returns a best-effort hint of how long until the next slot
    /// frees up (used only for logging).
    pub fn try_admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        if windows.iter_mut().all(|w| w.would_admit(now)) {
            for window in windows.iter_mut() {
                window.record(now);
            }
            Ok(())
        } else {
            Err(Self::wait_hint(&windows, now))
        }
    }

    /// Non-recording admission check, for eligibility filtering when the
    /// caller must coordinate recording across several limiters.
    pub fn would_admit(&self) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.iter_mut().all(|w| w.would_admit(now))
    }

    /// Unconditionally record an admission in every window. Callers pair this
    /// with [`would_admit`](Self::would_admit) under their own lock.
    pub fn record(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        for window in windows.iter_mut() {
            window.record(now);
        }
    }

    /// Best-effort wait until some window frees a slot.
    pub fn next_available(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        for window in windows.iter_mut() {
            window.prune(now);
        }
        let hint = Self::wait_hint(&windows, now);
        (hint > Duration::ZERO).then_some(hint)
    }

    fn wait_hint(windows: &[RateWindow], now: Instant) -> Duration {
        windows
            .iter()
            .filter_map(|w| w.next_available(now))
            .max()
            .unwrap_or_default()
    }
}
