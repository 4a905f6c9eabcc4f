// Shutdown - graceful-then-forced termination of a single process

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// No termination in progress
    Idle,
    /// A stop was accepted; the first request is being delivered
    Requested,
    /// Waiting for the child to exit within the grace period
    AwaitingChildAck,
    /// Grace period elapsed, forceful kill sent
    Forcing,
    /// The request completed
    Terminated,
}

/// What the supervisor must do after `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Nothing is running: complete now
    Complete,
    /// A request is already outstanding; do not re-signal
    Joined,
    /// Send the cooperative shutdown message and arm the grace timer
    SendShutdownMessage,
    /// Send the polite signal to the tree and arm the grace timer
    SendPoliteSignal,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: ShutdownPhase,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            phase: ShutdownPhase::Idle,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.phase,
            ShutdownPhase::Requested | ShutdownPhase::AwaitingChildAck | ShutdownPhase::Forcing
        )
    }

    /// Accept a stop request for a process that is `live` (has a handle)
    /// and may offer a `cooperative` message channel.
    pub fn begin(&mut self, live: bool, cooperative: bool) -> ShutdownStep {
        if self.in_progress() {
            return ShutdownStep::Joined;
        }

        if !live {
            self.phase = ShutdownPhase::Terminated;
            return ShutdownStep::Complete;
        }

        self.phase = ShutdownPhase::Requested;
        if cooperative {
            ShutdownStep::SendShutdownMessage
        } else {
            ShutdownStep::SendPoliteSignal
        }
    }

    /// The first request was delivered and the grace timer is armed
    pub fn armed(&mut self) {
        if self.phase == ShutdownPhase::Requested {
            self.phase = ShutdownPhase::AwaitingChildAck;
        }
    }

    /// The grace timer fired. Returns true exactly once per request, when a
    /// forceful kill must be sent.
    pub fn grace_expired(&mut self) -> bool {
        match self.phase {
            ShutdownPhase::Requested | ShutdownPhase::AwaitingChildAck => {
                self.phase = ShutdownPhase::Forcing;
                true
            }
            _ => false,
        }
    }

    /// The process exited. Returns true when this completes a request.
    pub fn process_exited(&mut self) -> bool {
        self.finish()
    }

    /// The tree terminator failed. The request still completes so callers
    /// are not blocked.
    pub fn termination_failed(&mut self) -> bool {
        self.finish()
    }

    /// Forget a completed request before a new launch
    pub fn reset(&mut self) {
        self.phase = ShutdownPhase::Idle;
    }

    fn finish(&mut self) -> bool {
        if self.in_progress() {
            self.phase = ShutdownPhase::Terminated;
            true
        } else {
            false
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// What happens to a record once its stop completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterStop {
    /// Launch again and clear the stop flag (restart, memory breach)
    Relaunch,
    /// Drop the record from the registry (explicit stop)
    Remove,
}

impl AfterStop {
    /// An explicit stop wins over a pending relaunch
    fn merge(self, other: AfterStop) -> AfterStop {
        if self == AfterStop::Remove || other == AfterStop::Remove {
            AfterStop::Remove
        } else {
            AfterStop::Relaunch
        }
    }
}

/// The single outstanding completion of a stop request and everyone
/// waiting on it.
#[derive(Debug)]
pub struct PendingStop {
    after: AfterStop,
    waiters: Vec<oneshot::Sender<()>>,
}

impl PendingStop {
    pub fn new(after: AfterStop) -> Self {
        Self {
            after,
            waiters: Vec::new(),
        }
    }

    pub fn after(&self) -> AfterStop {
        self.after
    }

    /// Fold a further request into this one
    pub fn join(&mut self, after: AfterStop, waiter: Option<oneshot::Sender<()>>) {
        self.after = self.after.merge(after);
        self.waiters.extend(waiter);
    }

    /// Notify every waiter
    pub fn finish(self) {
        for waiter in self.waiters {
            let _ = waiter.send(());
        }
    }
}
