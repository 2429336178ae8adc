use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Decides which candidate presses of one line are far enough apart.
///
/// A candidate at `now` is accepted iff more than `window` has passed since the
/// last accepted one. A gap of exactly `window` is rejected. The first
/// candidate is always accepted, and a zero window accepts everything.
#[derive(Debug)]
pub struct DebounceGate {
    window: Duration,
    last_accepted: Mutex<Option<Duration>>,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn last_accepted(&self) -> Option<Duration> {
        *self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn consider(&self, now: Duration) -> Verdict {
        // decision and update share one critical section
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let accept = match *last {
            None => true,
            Some(_) if self.window.is_zero() => true,
            Some(previous) => now.saturating_sub(previous) > self.window,
        };
        if !accept {
            return Verdict::Reject;
        }
        // never move backwards, even for out of order timestamps
        *last = Some(last.map_or(now, |previous| previous.max(now)));
        Verdict::Accept
    }
}
