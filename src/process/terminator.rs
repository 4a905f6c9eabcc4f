use crate::error::{Result, WardenError};
use std::collections::VecDeque;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Strength of a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM: ask the tree to exit
    Polite,
    /// SIGKILL: no negotiation
    Forceful,
}

/// Kills a process together with its descendants
pub trait TreeTerminator: Send + Sync {
    fn terminate(&self, pid: u32, signal: StopSignal) -> Result<()>;
}

/// Signals a process tree discovered through the OS process table
pub struct SignalTerminator {
    system: Mutex<System>,
}

impl SignalTerminator {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Descendants of `root`, deepest generations last
    fn descendants(&self, root: u32) -> Result<Vec<u32>> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| WardenError::SignalError("process table lock poisoned".to_string()))?;
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut found = Vec::new();
        let mut queue = VecDeque::from([Pid::from_u32(root)]);

        while let Some(parent) = queue.pop_front() {
            for (pid, process) in system.processes() {
                if process.parent() == Some(parent) && !found.contains(&pid.as_u32()) {
                    found.push(pid.as_u32());
                    queue.push_back(*pid);
                }
            }
        }

        Ok(found)
    }
}

impl Default for SignalTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeTerminator for SignalTerminator {
    fn terminate(&self, pid: u32, signal: StopSignal) -> Result<()> {
        let children = self.descendants(pid).unwrap_or_else(|e| {
            debug!("Could not list children of {}: {}", pid, e);
            Vec::new()
        });

        // Children first so they are not reparented before being signalled
        for child in children.iter().rev() {
            if let Err(e) = send_signal(*child, signal) {
                debug!("Failed to signal child {} of {}: {}", child, pid, e);
            }
        }

        send_signal(pid, signal)
            .map_err(|e| WardenError::TerminationError(pid.to_string(), e.to_string()))
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: StopSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = match signal {
        StopSignal::Polite => Signal::SIGTERM,
        StopSignal::Forceful => Signal::SIGKILL,
    };

    match signal::kill(NixPid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // Already gone
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(WardenError::SignalError(format!(
            "Failed to send {} to {}: {}",
            sig, pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: StopSignal) -> Result<()> {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

    match system.process(sys_pid) {
        Some(process) if !process.kill() => Err(WardenError::SignalError(format!(
            "Failed to kill {}",
            pid
        ))),
        _ => Ok(()),
    }
}
