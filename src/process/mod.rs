// Process module - Supervision of OS processes

pub mod monitor;
pub mod registry;
pub mod resolver;
pub mod restart;
pub mod shutdown;
pub mod signals;
pub mod spawner;
pub mod supervisor;
pub mod terminator;
pub mod types;

pub use monitor::{SysinfoSampler, UsageMonitor, UsageSampler};
pub use resolver::{ManifestResolver, PathResolver};
pub use restart::{RestartPolicy, RestartTracker};
pub use signals::os_signal_source;
pub use spawner::{
    ControlMessage, ExitOutcome, LaunchRequest, LaunchedProcess, ProcessLauncher, ScriptKind,
    TokioLauncher,
};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use terminator::{SignalTerminator, StopSignal, TreeTerminator};
pub use types::{Completion, ProcessEvent, ProcessInfo, StartedProcess};
