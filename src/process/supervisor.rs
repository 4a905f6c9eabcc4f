// Supervisor - a single event loop owning every process record
// Lifecycle messages carry the generation of the launch that produced them;
// messages from an older generation are dropped.

use crate::config::{ProcessSpec, SupervisorSettings};
use crate::error::{Result, WardenError};
use crate::logs::OutputStream;
use crate::process::monitor::{SysinfoSampler, UsageMonitor, UsageSampler};
use crate::process::registry::Registry;
use crate::process::resolver::{ManifestResolver, PathResolver};
use crate::process::shutdown::{AfterStop, PendingStop, ShutdownStep};
use crate::process::spawner::{
    ControlMessage, ExitOutcome, LaunchedProcess, OutputReader, ProcessLauncher, ScriptKind,
    TokioLauncher,
};
use crate::process::terminator::{SignalTerminator, StopSignal, TreeTerminator};
use crate::process::types::{
    Completion, ProcessEvent, ProcessHandle, ProcessInfo, ProcessRecord, StartedProcess,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

type StoppingHook = Box<dyn FnOnce() + Send>;

/// A spec whose script, working directory and key are settled
struct PreparedStart {
    key: String,
    spec: ProcessSpec,
    script: PathBuf,
    cwd: PathBuf,
    kind: ScriptKind,
}

/// Caller of `start` waiting for the first launch attempt
struct StartReply {
    reply: oneshot::Sender<Result<StartedProcess>>,
    events: broadcast::Receiver<ProcessEvent>,
    registered: ProcessInfo,
}

enum Message {
    // Control surface
    Start {
        spec: ProcessSpec,
        reply: oneshot::Sender<Result<StartedProcess>>,
    },
    Stop {
        name: String,
        done: oneshot::Sender<()>,
    },
    Restart {
        name: String,
        done: oneshot::Sender<()>,
    },
    StopAll {
        done: oneshot::Sender<()>,
    },
    SetOnStopping(StoppingHook),
    Stopping,
    Subscribe {
        name: String,
        reply: oneshot::Sender<Option<broadcast::Receiver<ProcessEvent>>>,
    },
    Info {
        name: String,
        reply: oneshot::Sender<Option<ProcessInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<ProcessInfo>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Halt {
        done: oneshot::Sender<()>,
    },

    // Lifecycle events
    Register {
        prepared: PreparedStart,
        reply: oneshot::Sender<Result<StartedProcess>>,
    },
    Launched {
        key: String,
        generation: u64,
        result: Result<LaunchedProcess>,
        start: Option<StartReply>,
    },
    Output {
        key: String,
        generation: u64,
        stream: OutputStream,
        chunk: Vec<u8>,
    },
    Exited {
        key: String,
        generation: u64,
        outcome: io::Result<ExitOutcome>,
    },
    RestartDue {
        key: String,
        generation: u64,
    },
    GraceExpired {
        key: String,
        generation: u64,
    },
    MemoryExceeded {
        key: String,
        generation: u64,
        usage: u64,
    },
    TerminationFailed {
        key: String,
        generation: u64,
        error: WardenError,
    },
}

/// Handle to a running supervisor.
///
/// Cheap to clone. The event loop keeps running while a handle or a
/// supervised child exists; call [`Supervisor::shutdown`] to stop everything
/// deterministically.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    /// Supervisor with the default collaborators. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Resolve, register and launch a process.
    ///
    /// Only configuration errors are returned. A launch failure is reported
    /// as an `Error` event and the process enters the restart path.
    pub async fn start(&self, spec: ProcessSpec) -> Result<StartedProcess> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Start { spec, reply })?;
        rx.await.map_err(|_| WardenError::SupervisorClosed)?
    }

    /// Gracefully stop a process and forget it. Unknown names complete at once.
    pub fn stop_by_name(&self, name: &str) -> Completion {
        let (done, completion) = Completion::channel();
        let _ = self.tx.send(Message::Stop {
            name: name.to_string(),
            done,
        });
        completion
    }

    /// Gracefully stop a process, then launch it again
    pub fn restart_by_name(&self, name: &str) -> Completion {
        let (done, completion) = Completion::channel();
        let _ = self.tx.send(Message::Restart {
            name: name.to_string(),
            done,
        });
        completion
    }

    pub fn stop_all(&self) -> Completion {
        let (done, completion) = Completion::channel();
        let _ = self.tx.send(Message::StopAll { done });
        completion
    }

    /// Register the hook run once on the first shutdown notification.
    /// Without a hook, that notification stops every process.
    pub fn set_on_stopping<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Message::SetOnStopping(Box::new(hook)));
    }

    /// Deliver one shutdown notification
    pub fn notify_stopping(&self) {
        let _ = self.tx.send(Message::Stopping);
    }

    /// Forward every notification of a shutdown signal source
    pub fn attach_signal_source(&self, mut source: mpsc::Receiver<()>) {
        let supervisor = self.tx.downgrade();
        tokio::spawn(async move {
            while source.recv().await.is_some() {
                let Some(tx) = supervisor.upgrade() else {
                    break;
                };
                if tx.send(Message::Stopping).is_err() {
                    break;
                }
            }
        });
    }

    pub async fn subscribe(&self, name: &str) -> Option<broadcast::Receiver<ProcessEvent>> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Subscribe {
            name: name.to_string(),
            reply,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn info(&self, name: &str) -> Option<ProcessInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Info {
            name: name.to_string(),
            reply,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        let (reply, rx) = oneshot::channel();
        if self.send(Message::List { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop every process and end the event loop
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Message::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| WardenError::SupervisorClosed)
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Injects collaborators and settings before the event loop starts
pub struct SupervisorBuilder {
    launcher: Arc<dyn ProcessLauncher>,
    resolver: Arc<dyn PathResolver>,
    sampler: Arc<dyn UsageSampler>,
    terminator: Arc<dyn TreeTerminator>,
    settings: SupervisorSettings,
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self {
            launcher: Arc::new(TokioLauncher::new()),
            resolver: Arc::new(ManifestResolver::new()),
            sampler: Arc::new(SysinfoSampler::new()),
            terminator: Arc::new(SignalTerminator::new()),
            settings: SupervisorSettings::default(),
        }
    }
}

impl SupervisorBuilder {
    pub fn launcher(mut self, launcher: impl ProcessLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn resolver(mut self, resolver: impl PathResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn sampler(mut self, sampler: impl UsageSampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    pub fn terminator(mut self, terminator: impl TreeTerminator + 'static) -> Self {
        self.terminator = Arc::new(terminator);
        self
    }

    pub fn settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawn the event loop on the current tokio runtime
    pub fn build(self) -> Supervisor {
        let (tx, rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            registry: Registry::new(),
            launcher: self.launcher,
            resolver: self.resolver,
            sampler: self.sampler,
            terminator: self.terminator,
            settings: self.settings,
            tx: tx.downgrade(),
            generation: 0,
            on_stopping: None,
            stopping_fired: false,
        };
        tokio::spawn(event_loop.run(rx));

        Supervisor { tx }
    }
}

struct EventLoop {
    registry: Registry,
    launcher: Arc<dyn ProcessLauncher>,
    resolver: Arc<dyn PathResolver>,
    sampler: Arc<dyn UsageSampler>,
    terminator: Arc<dyn TreeTerminator>,
    settings: SupervisorSettings,
    /// Weak so that the loop ends once no handle or task can reach it
    tx: mpsc::WeakUnboundedSender<Message>,
    generation: u64,
    on_stopping: Option<StoppingHook>,
    stopping_fired: bool,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        debug!("Supervisor event loop started");

        while let Some(message) = rx.recv().await {
            if let Message::Halt { done } = message {
                let _ = done.send(());
                break;
            }
            self.handle(message);
        }

        debug!(
            "Supervisor event loop stopped ({} records left)",
            self.registry.len()
        );
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Start { spec, reply } => self.start(spec, reply),
            Message::Stop { name, done } => self.request_stop(&name, AfterStop::Remove, done),
            Message::Restart { name, done } => {
                self.request_stop(&name, AfterStop::Relaunch, done)
            }
            Message::StopAll { done } => self.stop_all(done),
            Message::SetOnStopping(hook) => self.on_stopping = Some(hook),
            Message::Stopping => self.stopping(),
            Message::Subscribe { name, reply } => {
                let events = self
                    .registry
                    .find_key(&name)
                    .and_then(|key| self.registry.get(&key))
                    .map(ProcessRecord::subscribe);
                let _ = reply.send(events);
            }
            Message::Info { name, reply } => {
                let info = self
                    .registry
                    .find_key(&name)
                    .and_then(|key| self.registry.get(&key))
                    .map(ProcessRecord::info);
                let _ = reply.send(info);
            }
            Message::List { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Message::Shutdown { done } => self.shutdown(done),
            Message::Halt { done } => {
                let _ = done.send(());
            }
            Message::Register { prepared, reply } => self.register(prepared, reply),
            Message::Launched {
                key,
                generation,
                result,
                start,
            } => self.on_launched(&key, generation, result, start),
            Message::Output {
                key,
                generation,
                stream,
                chunk,
            } => self.on_output(&key, generation, stream, &chunk),
            Message::Exited {
                key,
                generation,
                outcome,
            } => self.on_exit(&key, generation, outcome),
            Message::RestartDue { key, generation } => self.on_restart_due(&key, generation),
            Message::GraceExpired { key, generation } => self.on_grace_expired(&key, generation),
            Message::MemoryExceeded {
                key,
                generation,
                usage,
            } => self.on_memory_exceeded(&key, generation, usage),
            Message::TerminationFailed {
                key,
                generation,
                error,
            } => self.on_termination_failed(&key, generation, error),
        }
    }

    /// Settle the spec off the loop; resolution may read the filesystem
    fn start(&self, spec: ProcessSpec, reply: oneshot::Sender<Result<StartedProcess>>) {
        let Some(tx) = self.tx.upgrade() else {
            let _ = reply.send(Err(WardenError::SupervisorClosed));
            return;
        };
        let resolver = self.resolver.clone();

        tokio::spawn(async move {
            let prepared =
                tokio::task::spawn_blocking(move || prepare_start(spec, resolver.as_ref()))
                    .await
                    .unwrap_or_else(|e| Err(WardenError::ResolutionError(e.to_string())));

            match prepared {
                Ok(prepared) => {
                    let _ = tx.send(Message::Register { prepared, reply });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn register(&mut self, prepared: PreparedStart, reply: oneshot::Sender<Result<StartedProcess>>) {
        let PreparedStart {
            key,
            spec,
            script,
            cwd,
            kind,
        } = prepared;

        if self.registry.contains(&key) {
            let _ = reply.send(Err(WardenError::ProcessAlreadyExists(key)));
            return;
        }

        let record = ProcessRecord::new(
            key.clone(),
            spec,
            script,
            cwd,
            kind,
            self.settings.log_rotation_bytes,
        );
        let events = record.subscribe();
        let registered = record.info();
        if let Err(e) = self.registry.insert(record) {
            let _ = reply.send(Err(e));
            return;
        }

        info!("Starting process '{}' ({})", key, kind);
        self.launch(
            &key,
            Some(StartReply {
                reply,
                events,
                registered,
            }),
        );
    }

    /// Begin a new lifecycle of a registered record. The launcher runs on the
    /// blocking pool and its result comes back as `Launched`.
    fn launch(&mut self, key: &str, start: Option<StartReply>) {
        self.generation += 1;
        let generation = self.generation;

        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };

        record.cancel_restart_timer();
        record.cancel_grace_timer();
        record.shutdown.reset();
        record.handle = None;
        record.usage_monitor = None;
        record.generation = generation;
        record.tracker.mark_started(Instant::now());

        let request = record.launch_request();
        let launcher = self.launcher.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || launcher.launch(&request))
                .await
                .unwrap_or_else(|e| Err(WardenError::SpawnError(e.to_string())));

            // An undelivered child is killed on drop
            let _ = tx.send(Message::Launched {
                key,
                generation,
                result,
                start,
            });
        });
    }

    fn on_launched(
        &mut self,
        key: &str,
        generation: u64,
        result: Result<LaunchedProcess>,
        start: Option<StartReply>,
    ) {
        self.adopt(key, generation, result);

        if let Some(start) = start {
            let info = self
                .registry
                .get(key)
                .map(ProcessRecord::info)
                .unwrap_or(start.registered);
            let _ = start.reply.send(Ok(StartedProcess {
                info,
                events: start.events,
            }));
        }
    }

    fn adopt(&mut self, key: &str, generation: u64, result: Result<LaunchedProcess>) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let Some(record) = self.registry.get_mut(key) else {
            debug!("Discarding launch of removed process '{}'", key);
            return;
        };
        if record.generation != generation {
            debug!("Discarding superseded launch of '{}'", key);
            return;
        }

        match result {
            Ok(launched) => {
                let pid = launched.pid;
                info!("Process '{}' launched (pid {})", key, pid);

                record.handle = Some(watch(
                    key,
                    generation,
                    launched,
                    tx.clone(),
                    self.settings.output_drain_timeout,
                ));
                record.emit(ProcessEvent::Started { pid });

                if let Some(threshold) = record.spec.memory_threshold_bytes {
                    record.usage_monitor = Some(arm_monitor(
                        key,
                        generation,
                        pid,
                        threshold,
                        self.settings.usage_poll_interval,
                        self.sampler.clone(),
                        tx,
                    ));
                }
            }
            Err(e) => {
                error!("Failed to launch '{}': {}", key, e);
                record.emit(ProcessEvent::Error {
                    message: e.to_string(),
                });
                schedule_restart(record, &tx);
            }
        }
    }

    fn on_output(&mut self, key: &str, generation: u64, stream: OutputStream, chunk: &[u8]) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation || !record.is_running() {
            return;
        }

        for line in record.capture.push(stream, chunk) {
            record.output.emit(&line);
        }
    }

    fn on_exit(&mut self, key: &str, generation: u64, outcome: io::Result<ExitOutcome>) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation {
            debug!("Ignoring exit of an earlier run of '{}'", key);
            return;
        }
        // A second notification for the same lifecycle
        let Some(handle) = record.handle.take() else {
            return;
        };
        let pid = handle.pid;
        drop(handle);

        for line in record.capture.flush() {
            record.output.emit(&line);
        }
        record.usage_monitor = None;

        match outcome {
            Ok(outcome) => {
                if outcome.success() {
                    info!("Process '{}' (pid {}) {}", key, pid, outcome.describe());
                } else {
                    warn!("Process '{}' (pid {}) {}", key, pid, outcome.describe());
                }
                record.emit(ProcessEvent::Exit {
                    status: outcome.describe(),
                    pid: Some(pid),
                });
            }
            Err(e) => {
                error!("Lost track of process '{}' (pid {}): {}", key, pid, e);
                record.emit(ProcessEvent::Error {
                    message: format!("Failed to wait for process: {}", e),
                });
            }
        }

        if record.shutdown.process_exited() {
            self.complete_stop(key);
        } else if !record.stop_requested {
            if let Some(tx) = self.tx.upgrade() {
                schedule_restart(record, &tx);
            }
        }
    }

    fn on_restart_due(&mut self, key: &str, generation: u64) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation || record.is_running() || record.stop_requested {
            debug!("Dropping superseded restart of '{}'", key);
            return;
        }

        record.restart_timer = None;
        record.restarts += 1;
        record.emit(ProcessEvent::Restart);
        self.launch(key, None);
    }

    fn on_memory_exceeded(&mut self, key: &str, generation: u64, usage: u64) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation || !record.is_running() || record.shutdown.in_progress()
        {
            return;
        }

        let threshold = record.spec.memory_threshold_bytes.unwrap_or_default();
        warn!(
            "Process '{}' uses {} bytes, above its limit of {} bytes; restarting",
            key, usage, threshold
        );
        record.usage_monitor = None;
        record.emit(ProcessEvent::MemoryExceeded { usage, threshold });

        self.graceful_stop(key, AfterStop::Relaunch, None);
    }

    fn request_stop(&mut self, name: &str, after: AfterStop, done: oneshot::Sender<()>) {
        match self.registry.find_key(name) {
            Some(key) => self.graceful_stop(&key, after, Some(done)),
            None => {
                debug!("No process named '{}'", name);
                let _ = done.send(());
            }
        }
    }

    /// Start (or join) the termination of one record
    fn graceful_stop(&mut self, key: &str, after: AfterStop, waiter: Option<oneshot::Sender<()>>) {
        let Some(record) = self.registry.get_mut(key) else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
            return;
        };

        record.stop_requested = true;
        record.cancel_restart_timer();
        record.usage_monitor = None;
        record
            .pending_stop
            .get_or_insert_with(|| PendingStop::new(after))
            .join(after, waiter);

        let (live, cooperative) = match record.handle {
            Some(ref handle) => (true, handle.control.is_some()),
            None => (false, false),
        };
        let step = record.shutdown.begin(live, cooperative);
        let pid = record.pid();
        let generation = record.generation;

        match step {
            ShutdownStep::Joined => debug!("Stop of '{}' already in progress", key),
            ShutdownStep::Complete => self.complete_stop(key),
            ShutdownStep::SendShutdownMessage | ShutdownStep::SendPoliteSignal => {
                let delivered =
                    step == ShutdownStep::SendShutdownMessage && self.send_shutdown_message(key);
                if !delivered {
                    if let Some(pid) = pid {
                        info!("Sending polite stop to '{}' (pid {})", key, pid);
                        self.dispatch_termination(key, generation, pid, StopSignal::Polite);
                    }
                }
                self.arm_grace_timer(key, generation);
            }
        }
    }

    fn send_shutdown_message(&self, key: &str) -> bool {
        let delivered = self
            .registry
            .get(key)
            .and_then(|record| record.handle.as_ref())
            .and_then(|handle| handle.control.as_ref())
            .map(|control| control.send(ControlMessage::Shutdown).is_ok())
            .unwrap_or(false);

        if delivered {
            info!("Asked '{}' to shut down", key);
        }
        delivered
    }

    fn arm_grace_timer(&mut self, key: &str, generation: u64) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };

        let grace = self.settings.grace_period;
        let timer_key = key.to_string();
        record.cancel_grace_timer();
        record.grace_timer = Some(tokio::spawn(async move {
            sleep(grace).await;
            let _ = tx.send(Message::GraceExpired {
                key: timer_key,
                generation,
            });
        }));
        record.shutdown.armed();
    }

    fn on_grace_expired(&mut self, key: &str, generation: u64) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation {
            return;
        }

        record.grace_timer = None;
        if !record.shutdown.grace_expired() {
            return;
        }

        if let Some(pid) = record.pid() {
            warn!(
                "Process '{}' (pid {}) did not exit within {:?}; killing it",
                key, pid, self.settings.grace_period
            );
            self.dispatch_termination(key, generation, pid, StopSignal::Forceful);
        }
    }

    /// Run the tree terminator off the event loop; only failures come back
    fn dispatch_termination(&self, key: &str, generation: u64, pid: u32, signal: StopSignal) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let terminator = self.terminator.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || terminator.terminate(pid, signal)).await;

            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(e) => WardenError::TerminationError(pid.to_string(), e.to_string()),
            };
            let _ = tx.send(Message::TerminationFailed {
                key,
                generation,
                error,
            });
        });
    }

    fn on_termination_failed(&mut self, key: &str, generation: u64, error: WardenError) {
        error!("Failed to terminate '{}': {}", key, error);

        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        if record.generation != generation {
            return;
        }

        record.emit(ProcessEvent::Error {
            message: error.to_string(),
        });
        if record.shutdown.termination_failed() {
            self.complete_stop(key);
        }
    }

    /// Run the after-action of a finished stop and notify its waiters
    fn complete_stop(&mut self, key: &str) {
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        record.cancel_grace_timer();
        let Some(pending) = record.pending_stop.take() else {
            return;
        };

        match pending.after() {
            AfterStop::Remove => {
                record.cancel_restart_timer();
                record.emit(ProcessEvent::Stopped);
                info!("Process '{}' stopped", key);
                self.registry.remove(key);
            }
            AfterStop::Relaunch => {
                record.stop_requested = false;
                record.restarts += 1;
                record.emit(ProcessEvent::Restart);
                info!("Relaunching process '{}'", key);
                self.launch(key, None);
            }
        }

        pending.finish();
    }

    fn stop_all(&mut self, done: oneshot::Sender<()>) {
        let keys = self.registry.keys();
        info!("Stopping {} process(es)", keys.len());

        let mut completions = Vec::with_capacity(keys.len());
        for key in keys {
            let (waiter, completion) = Completion::channel();
            self.graceful_stop(&key, AfterStop::Remove, Some(waiter));
            completions.push(completion);
        }

        tokio::spawn(async move {
            for completion in completions {
                completion.wait().await;
            }
            let _ = done.send(());
        });
    }

    fn stopping(&mut self) {
        if self.stopping_fired {
            debug!("Shutdown already signalled");
            return;
        }
        self.stopping_fired = true;

        match self.on_stopping.take() {
            Some(hook) => {
                info!("Shutdown signalled, running stopping hook");
                hook();
            }
            None => {
                info!("Shutdown signalled, stopping all processes");
                let (done, _) = oneshot::channel();
                self.stop_all(done);
            }
        }
    }

    fn shutdown(&mut self, done: oneshot::Sender<()>) {
        let Some(tx) = self.tx.upgrade() else {
            let _ = done.send(());
            return;
        };

        let (stopped, completion) = Completion::channel();
        self.stop_all(stopped);

        tokio::spawn(async move {
            completion.wait().await;
            let _ = tx.send(Message::Halt { done });
        });
    }
}

/// Validate a spec and settle its working directory, script and key
fn prepare_start(spec: ProcessSpec, resolver: &dyn PathResolver) -> Result<PreparedStart> {
    spec.validate()?;

    let cwd = match spec.cwd {
        Some(ref cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };

    let script = match spec.script {
        Some(ref script) if script.is_relative() => cwd.join(script),
        Some(ref script) => script.clone(),
        None => resolver.resolve(&cwd)?,
    };

    let kind = ScriptKind::classify(&script)?;
    let key = spec
        .name
        .clone()
        .unwrap_or_else(|| script.display().to_string());

    let mut resolved = spec;
    resolved.script = Some(script.clone());
    resolved.cwd = Some(cwd.clone());

    Ok(PreparedStart {
        key,
        spec: resolved,
        script,
        cwd,
        kind,
    })
}

/// Schedule the next relaunch according to the record's back-off
fn schedule_restart(record: &mut ProcessRecord, tx: &mpsc::UnboundedSender<Message>) {
    if record.stop_requested {
        return;
    }

    let delay = record.policy.next_delay(&mut record.tracker, Instant::now());
    info!(
        "Restarting process '{}' in {:?} (attempt {})",
        record.key,
        delay,
        record.tracker.restart_index()
    );

    let key = record.key.clone();
    let generation = record.generation;
    let tx = tx.clone();

    record.cancel_restart_timer();
    record.restart_timer = Some(tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(Message::RestartDue { key, generation });
    }));
}

fn arm_monitor(
    key: &str,
    generation: u64,
    pid: u32,
    threshold: u64,
    every: Duration,
    sampler: Arc<dyn UsageSampler>,
    tx: mpsc::UnboundedSender<Message>,
) -> UsageMonitor {
    let key = key.to_string();
    UsageMonitor::spawn(pid, threshold, every, sampler, move |usage| {
        let _ = tx.send(Message::MemoryExceeded {
            key,
            generation,
            usage,
        });
    })
}

/// Take ownership of a launched child: forward its output, then report its
/// exit once both streams are drained.
fn watch(
    key: &str,
    generation: u64,
    launched: LaunchedProcess,
    tx: mpsc::UnboundedSender<Message>,
    drain_timeout: Duration,
) -> ProcessHandle {
    let LaunchedProcess {
        pid,
        stdout,
        stderr,
        control,
        exit,
    } = launched;

    let mut readers = Vec::new();
    for (stream, reader) in [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)] {
        if let Some(reader) = reader {
            readers.push(tokio::spawn(forward_output(
                reader,
                stream,
                key.to_string(),
                generation,
                tx.clone(),
            )));
        }
    }

    let key = key.to_string();
    let watcher = tokio::spawn(async move {
        let outcome = exit.await;

        let drained = tokio::time::timeout(drain_timeout, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Output of '{}' still open after exit", key);
            for reader in &readers {
                reader.abort();
            }
        }

        let _ = tx.send(Message::Exited {
            key,
            generation,
            outcome,
        });
    });

    ProcessHandle {
        pid,
        control,
        watcher,
    }
}

async fn forward_output(
    mut reader: OutputReader,
    stream: OutputStream,
    key: String,
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let message = Message::Output {
                    key: key.clone(),
                    generation,
                    stream,
                    chunk: buf[..n].to_vec(),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Reading {} of '{}' failed: {}", stream, key, e);
                break;
            }
        }
    }
}
