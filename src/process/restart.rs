use std::time::{Duration, Instant};

/// Restart back-off: a list of delays walked by a cursor that saturates at
/// the last entry and resets once a run outlives the grace window.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Delays tried in order; the last one repeats
    intervals: Vec<Duration>,
    /// Uptime after which a run counts as healthy
    grace_window: Duration,
}

impl RestartPolicy {
    /// Create a policy. An empty interval list restarts immediately.
    pub fn new(intervals: Vec<Duration>, grace_window: Duration) -> Self {
        let intervals = if intervals.is_empty() {
            vec![Duration::ZERO]
        } else {
            intervals
        };

        Self {
            intervals,
            grace_window,
        }
    }

    /// Build the policy declared by a process spec
    pub fn from_spec(spec: &crate::config::ProcessSpec) -> Self {
        Self::new(spec.restart_intervals(), spec.restart_grace_window())
    }

    /// Compute the delay before the next restart and advance the tracker.
    ///
    /// A process that ran longer than the grace window since its last launch
    /// is treated as freshly started: the cursor goes back to the first delay.
    pub fn next_delay(&self, tracker: &mut RestartTracker, now: Instant) -> Duration {
        let uptime = now.saturating_duration_since(tracker.last_started_at);
        if uptime > self.grace_window {
            tracker.restart_index = 0;
        }

        let slot = tracker.restart_index.min(self.intervals.len() - 1);
        tracker.restart_index += 1;
        self.intervals[slot]
    }
}

/// Restart history of one process
#[derive(Debug, Clone)]
pub struct RestartTracker {
    last_started_at: Instant,
    restart_index: usize,
}

impl RestartTracker {
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_started_at: started_at,
            restart_index: 0,
        }
    }

    /// Record a launch
    pub fn mark_started(&mut self, at: Instant) {
        self.last_started_at = at;
    }

    pub fn restart_index(&self) -> usize {
        self.restart_index
    }
}
