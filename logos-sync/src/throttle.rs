//! Leading-edge throttle for pointer samples.
//!
//! A sample is forwarded when at least `window` has elapsed since the last
//! forwarded one; everything in between is dropped. There is no trailing
//! flush: the next pointer move carries a fresher position anyway.

use std::time::{Duration, Instant};

use crate::model::CursorPosition;

/// Default window between outbound cursor updates (20 updates/s).
pub const DEFAULT_CURSOR_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CursorThrottler {
    window: Duration,
    last_sent_at: Option<Instant>,
    forwarded: u64,
    dropped: u64,
}

impl CursorThrottler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent_at: None,
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Submit a raw pointer sample. Returns the position to broadcast, if any.
    pub fn submit(&mut self, x: f64, y: f64) -> Option<CursorPosition> {
        self.submit_at(Instant::now(), x, y)
    }

    /// Same as [`submit`](Self::submit) with an explicit monotonic timestamp.
    pub fn submit_at(&mut self, now: Instant, x: f64, y: f64) -> Option<CursorPosition> {
        let due = match self.last_sent_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };

        if !due {
            self.dropped += 1;
            return None;
        }

        self.last_sent_at = Some(now);
        self.forwarded += 1;
        Some(CursorPosition::new(x, y))
    }

    /// Forget the last send time, so the next sample goes out immediately.
    pub fn reset(&mut self) {
        self.last_sent_at = None;
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for CursorThrottler {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_WINDOW)
    }
}
