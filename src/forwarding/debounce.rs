use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bus::ValueEvent;

/// What happens to values that arrive while the window is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceMode {
    /// Keep the newest value and emit it when the window expires.
    #[default]
    Latest,
    /// Discard them; the next value after the window passes straight through.
    Drop,
}

/// Leading-edge rate limiter for one path.
///
/// The first value passes immediately and opens a window of `min_interval`.
/// Time is passed in by the caller, which keeps this free of any timer.
#[derive(Debug)]
pub struct Debouncer {
    min_interval: Duration,
    mode: DebounceMode,
    window_end: Option<Instant>,
    pending: Option<ValueEvent>,
}

impl Debouncer {
    pub fn new(min_interval: Duration, mode: DebounceMode) -> Self {
        Self {
            min_interval,
            mode,
            window_end: None,
            pending: None,
        }
    }

    /// Feeds a value in, returning it if it may be emitted right away.
    pub fn offer(&mut self, event: ValueEvent, now: Instant) -> Option<ValueEvent> {
        if self.min_interval.is_zero() {
            return Some(event);
        }

        match self.window_end {
            Some(end) if now < end => {
                if self.mode == DebounceMode::Latest {
                    self.pending = Some(event);
                }
                None
            }
            _ => {
                self.pending = None;
                self.window_end = Some(now + self.min_interval);
                Some(event)
            }
        }
    }

    /// When the open window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.window_end
    }

    /// Closes the window. A pending value is returned and opens a new window;
    /// without one the debouncer goes idle.
    pub fn expire(&mut self, now: Instant) -> Option<ValueEvent> {
        match self.pending.take() {
            Some(event) => {
                self.window_end = Some(now + self.min_interval);
                Some(event)
            }
            None => {
                self.window_end = None;
                None
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
