use crate::config::ProcessSpec;
use crate::logs::{EchoSink, LogSink, LogWriter, OutputCapture, OutputSink};
use crate::process::monitor::UsageMonitor;
use crate::process::restart::{RestartPolicy, RestartTracker};
use crate::process::shutdown::{PendingStop, ShutdownCoordinator};
use crate::process::spawner::{ControlMessage, LaunchRequest, ScriptKind};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of each record's observer channel
const EVENT_CAPACITY: usize = 64;

/// Notifications observers receive about one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Exit { status: String, pid: Option<u32> },
    Error { message: String },
    Restart,
    MemoryExceeded { usage: u64, threshold: u64 },
    Stopped,
}

/// The live OS process of a record
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub control: Option<mpsc::UnboundedSender<ControlMessage>>,
    /// Owns the child; sends the exit event
    pub watcher: JoinHandle<()>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Aborting drops the child, which is killed on drop
        self.watcher.abort();
    }
}

/// Mutable supervision state of one registry entry
#[derive(Debug)]
pub struct ProcessRecord {
    pub key: String,
    pub spec: ProcessSpec,
    pub script: PathBuf,
    pub cwd: PathBuf,
    pub kind: ScriptKind,
    pub handle: Option<ProcessHandle>,
    /// Launch counter stamped on every asynchronous event of a lifecycle
    pub generation: u64,
    pub policy: RestartPolicy,
    pub tracker: RestartTracker,
    pub stop_requested: bool,
    pub usage_monitor: Option<UsageMonitor>,
    pub restart_timer: Option<JoinHandle<()>>,
    pub grace_timer: Option<JoinHandle<()>>,
    pub capture: OutputCapture,
    pub output: OutputSink,
    pub shutdown: ShutdownCoordinator,
    pub pending_stop: Option<PendingStop>,
    pub events: broadcast::Sender<ProcessEvent>,
    pub restarts: u64,
}

impl ProcessRecord {
    /// Build a record for a resolved spec. Spawns the log writer and echo
    /// tasks the spec asks for, so this must run inside a tokio runtime in
    /// that case.
    pub fn new(
        key: String,
        spec: ProcessSpec,
        script: PathBuf,
        cwd: PathBuf,
        kind: ScriptKind,
        log_rotation_bytes: u64,
    ) -> Self {
        let log = spec
            .log_path
            .as_ref()
            .map(|path| LogSink::spawn(LogWriter::new(path, log_rotation_bytes)));
        let echo = spec.debug_echo.then(EchoSink::stdio);
        let output = OutputSink::new(
            key.clone(),
            spec.prefix_lines,
            spec.log_timestamps,
            log,
            echo,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            policy: RestartPolicy::from_spec(&spec),
            tracker: RestartTracker::new(Instant::now()),
            capture: OutputCapture::new(spec.strip_escape_codes),
            key,
            spec,
            script,
            cwd,
            kind,
            handle: None,
            generation: 0,
            stop_requested: false,
            usage_monitor: None,
            restart_timer: None,
            grace_timer: None,
            output,
            shutdown: ShutdownCoordinator::new(),
            pending_stop: None,
            events,
            restarts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    /// Broadcast to observers; having none is fine
    pub fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    pub fn cancel_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    pub fn launch_request(&self) -> LaunchRequest {
        LaunchRequest {
            name: self.key.clone(),
            script: self.script.clone(),
            kind: self.kind,
            args: self.spec.args.clone(),
            script_args: self.spec.script_args.clone(),
            cwd: self.cwd.clone(),
            env: self.spec.env.clone(),
            stdio: self.spec.stdio,
        }
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            name: self.key.clone(),
            script: self.script.clone(),
            kind: self.kind,
            pid: self.pid(),
            running: self.is_running(),
            restart_index: self.tracker.restart_index(),
            restarts: self.restarts,
            stop_requested: self.stop_requested,
            monitored: self.usage_monitor.is_some(),
            restart_pending: self.restart_timer.is_some(),
        }
    }
}

/// Point-in-time view of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub script: PathBuf,
    pub kind: ScriptKind,
    pub pid: Option<u32>,
    pub running: bool,
    pub restart_index: usize,
    pub restarts: u64,
    pub stop_requested: bool,
    pub monitored: bool,
    pub restart_pending: bool,
}

/// Returned by `start`: the record snapshot and its event stream
#[derive(Debug)]
pub struct StartedProcess {
    pub info: ProcessInfo,
    pub events: broadcast::Receiver<ProcessEvent>,
}

/// Fires once when an asynchronous control operation has finished.
/// Dropping it turns the operation into fire-and-forget.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl Completion {
    pub fn channel() -> (oneshot::Sender<()>, Completion) {
        let (tx, rx) = oneshot::channel();
        (tx, Completion { rx })
    }

    /// Wait for the operation. Also returns if the supervisor went away.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}
