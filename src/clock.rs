//! Wall-clock sources.
//!
//! Leader records are compared across tabs by wall-clock milliseconds, so every
//! component that stamps or ages a record reads time through [`Clock`].

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        to_datetime(self.now_ms())
    }
}

/// 系统时钟（生产用）
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that advances with tokio's timer, so `tokio::time::pause()` and
/// `advance()` drive it. `skew_ms` models a tab whose clock runs ahead or behind.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch_ms: i64,
    origin: tokio::time::Instant,
    skew_ms: i64,
}

impl TokioClock {
    pub fn new(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            origin: tokio::time::Instant::now(),
            skew_ms: 0,
        }
    }

    /// Same time base, shifted by `skew_ms`.
    pub fn skewed(&self, skew_ms: i64) -> Self {
        Self { skew_ms, ..*self }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as i64 + self.skew_ms
    }
}

pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
