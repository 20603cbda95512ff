//! Client-side call governor for the model API.
//!
//! Two limits are applied together before every outbound call:
//! - at most `max_calls_per_window` calls inside a rolling one-minute window
//! - at least `min_interval_ms` between two consecutive calls
//!
//! The governor never reads a clock. Every operation takes `now_ms` (epoch
//! milliseconds) from the caller, so the panel decides where time comes from
//! and tests can replay exact timelines.

/// Length of the rolling count window.
pub const WINDOW_MS: i64 = 60_000;

/// Suggested default: calls allowed per one-minute window.
pub const DEFAULT_MAX_CALLS_PER_MINUTE: u32 = 10;

/// Suggested default: spacing between consecutive calls.
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 2_000;

/// Admission state for one panel instance.
///
/// Replace the whole value when the limits change; the limits themselves are
/// immutable for the governor's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallGovernor {
    max_calls_per_window: u32,
    min_interval_ms: u64,
    window_start_ms: i64,
    window_count: u32,
    /// `None` until the first call is recorded
    last_call_at_ms: Option<i64>,
}

impl CallGovernor {
    /// Create a governor whose first window starts at `now_ms`.
    ///
    /// `max_calls_per_window == 0` blocks every call for the governor's
    /// lifetime. `min_interval_ms == 0` disables the spacing limit.
    pub fn new(max_calls_per_window: u32, min_interval_ms: u64, now_ms: i64) -> Self {
        Self {
            max_calls_per_window,
            min_interval_ms,
            window_start_ms: now_ms,
            window_count: 0,
            last_call_at_ms: None,
        }
    }

    /// Check whether a call is admitted at `now_ms`.
    ///
    /// State transition: when more than [`WINDOW_MS`] has elapsed since the
    /// window started, the window restarts at `now_ms` with a zero count. That
    /// is the only way the window advances without a call being recorded.
    /// `last_call_at_ms` is never touched here.
    pub fn can_call(&mut self, now_ms: i64) -> bool {
        self.roll_window(now_ms);
        self.window_count < self.max_calls_per_window && self.spacing_satisfied(now_ms)
    }

    /// Count a call made at `now_ms`.
    ///
    /// Does not check admissibility. Call exactly once per call that goes out,
    /// including calls forced through without `can_call`.
    pub fn record_call(&mut self, now_ms: i64) {
        self.last_call_at_ms = Some(now_ms);
        self.window_count = self.window_count.saturating_add(1);
    }

    /// Advisory wait, in milliseconds, before `can_call` would admit a call.
    ///
    /// When the window is exhausted this is the time left until the window
    /// rolls over, without considering the spacing limit after rollover.
    /// With `max_calls_per_window == 0` the value is only a countdown to the
    /// next rollover; calls stay blocked regardless.
    pub fn time_until_next_call_ms(&self, now_ms: i64) -> u64 {
        if self.window_count >= self.max_calls_per_window {
            let remaining = self.window_start_ms.saturating_add(WINDOW_MS).saturating_sub(now_ms);
            return remaining.max(0) as u64;
        }

        match self.last_call_at_ms {
            Some(last) => {
                // A clock that went backwards makes `elapsed` negative, which
                // adds the gap to the wait.
                let elapsed = now_ms.saturating_sub(last);
                let interval = i64::try_from(self.min_interval_ms).unwrap_or(i64::MAX);
                if elapsed < interval {
                    interval.saturating_sub(elapsed) as u64
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub fn max_calls_per_window(&self) -> u32 {
        self.max_calls_per_window
    }

    pub fn min_interval_ms(&self) -> u64 {
        self.min_interval_ms
    }

    pub fn window_start_ms(&self) -> i64 {
        self.window_start_ms
    }

    /// Calls recorded since the current window started.
    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    pub fn last_call_at_ms(&self) -> Option<i64> {
        self.last_call_at_ms
    }

    /// True when both limits match, i.e. the governor can be kept across an
    /// options update.
    pub fn has_limits(&self, max_calls_per_window: u32, min_interval_ms: u64) -> bool {
        self.max_calls_per_window == max_calls_per_window && self.min_interval_ms == min_interval_ms
    }

    fn roll_window(&mut self, now_ms: i64) {
        if now_ms.saturating_sub(self.window_start_ms) > WINDOW_MS {
            tracing::debug!(
                previous_start_ms = self.window_start_ms,
                previous_count = self.window_count,
                now_ms,
                "call window rolled over"
            );
            self.window_start_ms = now_ms;
            self.window_count = 0;
        }
    }

    fn spacing_satisfied(&self, now_ms: i64) -> bool {
        match self.last_call_at_ms {
            None => true,
            Some(last) => {
                let elapsed = now_ms.saturating_sub(last);
                elapsed >= 0 && elapsed as u64 >= self.min_interval_ms
            }
        }
    }
}

impl Default for CallGovernor {
    /// Default limits with the window anchored at epoch zero; real callers
    /// should use [`CallGovernor::new`] with the current time.
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS_PER_MINUTE, DEFAULT_MIN_INTERVAL_MS, 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
