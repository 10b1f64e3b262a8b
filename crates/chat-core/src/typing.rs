use std::collections::BTreeSet;
use std::time::Duration;

/// What the driver should do after local input activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityOutcome {
    /// `Some(true)` on the first activity of a burst; `None` while already signaling.
    pub emit: Option<bool>,
    /// Re-arm the quiet timer; it must hand this epoch back when it fires.
    pub quiet_epoch: u64,
    pub quiet_after: Duration,
}

/// Debounces local keystrokes into single start/stop typing edges.
///
/// Every activity bumps an epoch. A quiet timer carries the epoch it was
/// armed with, so a timer superseded by newer activity is ignored when it
/// eventually fires.
#[derive(Debug, Clone)]
pub struct TypingSignaler {
    quiet_period: Duration,
    active: bool,
    epoch: u64,
}

impl TypingSignaler {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            active: false,
            epoch: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn on_activity(&mut self) -> ActivityOutcome {
        self.epoch += 1;
        let emit = if self.active {
            None
        } else {
            self.active = true;
            Some(true)
        };
        ActivityOutcome {
            emit,
            quiet_epoch: self.epoch,
            quiet_after: self.quiet_period,
        }
    }

    pub fn on_quiet_elapsed(&mut self, epoch: u64) -> Option<bool> {
        if epoch != self.epoch || !self.active {
            return None;
        }
        self.active = false;
        Some(false)
    }

    /// Sending a message ends the burst immediately.
    pub fn on_message_sent(&mut self) -> Option<bool> {
        self.epoch += 1;
        if !self.active {
            return None;
        }
        self.active = false;
        Some(false)
    }
}

/// Typing flags of remote participants, keyed by username.
#[derive(Debug, Clone, Default)]
pub struct RemoteTyping {
    typing: BTreeSet<String>,
}

impl RemoteTyping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the participant's flag actually changed.
    pub fn apply(&mut self, username: &str, is_typing: bool) -> bool {
        if is_typing {
            self.typing.insert(username.to_string())
        } else {
            self.typing.remove(username)
        }
    }

    pub fn is_typing(&self, username: &str) -> bool {
        self.typing.contains(username)
    }

    /// Clears every flag, returning the participants that were typing.
    pub fn clear(&mut self) -> Vec<String> {
        std::mem::take(&mut self.typing).into_iter().collect()
    }
}
