use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    LeaderHeartbeat,
    StatusReport,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeaderHeartbeat => "leader_heartbeat",
            Self::StatusReport => "status_report",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
pub enum TimerError {
    ZeroDelay { kind: TimerKind },
    DeadlineOverflow { kind: TimerKind, delay: Duration },
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDelay { kind } => {
                write!(f, "timer '{}' needs a non-zero delay", kind.as_str())
            }
            Self::DeadlineOverflow { kind, delay } => write!(
                f,
                "timer '{}' delay {delay:?} overflows the clock",
                kind.as_str()
            ),
        }
    }
}

impl std::error::Error for TimerError {}

/// Deadline-ordered one-shot timers, drained by the reactor thread.
///
/// Periodic work reschedules itself after each firing.
#[derive(Debug, Default)]
pub struct TimerWheel {
    next_id: u64,
    by_deadline: BTreeMap<(Instant, TimerId), TimerKind>,
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn schedule_after(&mut self, kind: TimerKind, delay: Duration) -> Result<TimerId, TimerError> {
        self.schedule_at(kind, Instant::now(), delay)
    }

    pub fn schedule_at(
        &mut self,
        kind: TimerKind,
        from: Instant,
        delay: Duration,
    ) -> Result<TimerId, TimerError> {
        if delay.is_zero() {
            return Err(TimerError::ZeroDelay { kind });
        }
        let deadline = from
            .checked_add(delay)
            .ok_or(TimerError::DeadlineOverflow { kind, delay })?;

        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.by_deadline.insert((deadline, id), kind);
        self.deadlines.insert(id, deadline);
        Ok(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// How long a poll may wait without missing the next deadline, capped.
    pub fn poll_timeout(&self, now: Instant, cap: Duration) -> Duration {
        self.next_deadline()
            .map_or(cap, |deadline| deadline.saturating_duration_since(now).min(cap))
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut due = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), kind) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, kind));
        }
        due
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}
