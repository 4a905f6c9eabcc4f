use crate::config::StdioMode;
use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Extensions launched through the script runtime
const INTERPRETED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// Runtime flags that would open a debugger port in the child
const DEBUG_ARG_PREFIXES: &[&str] = &["--inspect", "--debug"];

/// Byte stream of a child's stdout or stderr
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves once the child has exited
pub type ExitFuture = Pin<Box<dyn Future<Output = io::Result<ExitOutcome>> + Send>>;

/// How a script is launched, decided by its file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    /// Run through the script runtime with a cooperative control channel
    Interpreted,
    /// Spawned directly
    Binary,
}

impl ScriptKind {
    /// Classify a script: interpreted-source extensions use the runtime,
    /// extensionless files are executables, everything else is rejected.
    pub fn classify(script: &Path) -> Result<ScriptKind> {
        match script.extension().and_then(|ext| ext.to_str()) {
            None => Ok(ScriptKind::Binary),
            Some(ext) if INTERPRETED_EXTENSIONS.contains(&ext) => Ok(ScriptKind::Interpreted),
            Some(_) => Err(WardenError::UnsupportedScriptType(
                script.display().to_string(),
            )),
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptKind::Interpreted => write!(f, "script"),
            ScriptKind::Binary => write!(f, "binary"),
        }
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable status message carried by exit events
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited".to_string(),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Messages understood by children that have a control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Please exit cleanly
    Shutdown,
}

/// Everything a launcher needs for one launch attempt
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub script: PathBuf,
    pub kind: ScriptKind,
    pub args: Vec<String>,
    pub script_args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdio: StdioMode,
}

/// A freshly launched child, split into the parts the supervisor consumes
pub struct LaunchedProcess {
    pub pid: u32,
    pub stdout: Option<OutputReader>,
    pub stderr: Option<OutputReader>,
    /// Cooperative shutdown channel, if the child has one
    pub control: Option<mpsc::UnboundedSender<ControlMessage>>,
    /// Owns the OS child handle
    pub exit: ExitFuture,
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.pid)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("control", &self.control.is_some())
            .finish()
    }
}

/// Starts OS processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedProcess>;
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    /// Runtime used for interpreted scripts
    interpreter: PathBuf,
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::with_interpreter("node")
    }

    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    fn build_command(&self, request: &LaunchRequest) -> Command {
        let mut command = match request.kind {
            ScriptKind::Binary => {
                let mut command = Command::new(&request.script);
                command.stdin(Stdio::null());
                command
            }
            ScriptKind::Interpreted => {
                let mut command = Command::new(&self.interpreter);
                command.args(filter_debug_args(&request.script_args));
                command.arg(&request.script);
                command.env("WARDEN_PROCESS_NAME", &request.name);
                command.env("WARDEN_SUPERVISED", "1");
                // stdin carries control messages
                command.stdin(Stdio::piped());
                command
            }
        };

        command.args(&request.args);
        command.current_dir(&request.cwd);
        command.envs(&request.env);

        let (stdout, stderr) = match request.stdio {
            StdioMode::Pipe => (Stdio::piped(), Stdio::piped()),
            StdioMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
            StdioMode::Null => (Stdio::null(), Stdio::null()),
        };
        command.stdout(stdout);
        command.stderr(stderr);

        command.kill_on_drop(true);
        command
    }
}

impl Default for TokioLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedProcess> {
        if !request.script.exists() {
            return Err(WardenError::SpawnError(format!(
                "Script does not exist: {}",
                request.script.display()
            )));
        }

        let mut child = self.build_command(request).spawn().map_err(|e| {
            WardenError::SpawnError(format!("Failed to spawn process '{}': {}", request.name, e))
        })?;

        let pid = child.id().ok_or_else(|| {
            WardenError::SpawnError(format!("Failed to get PID for process '{}'", request.name))
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputReader);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputReader);
        let control = child
            .stdin
            .take()
            .map(|stdin| spawn_control_writer(request.name.clone(), stdin));

        let exit: ExitFuture =
            Box::pin(async move { child.wait().await.map(ExitOutcome::from) });

        Ok(LaunchedProcess {
            pid,
            stdout,
            stderr,
            control,
            exit,
        })
    }
}

/// Serialize control messages as JSON lines onto the child's stdin
fn spawn_control_writer(
    name: String,
    mut stdin: ChildStdin,
) -> mpsc::UnboundedSender<ControlMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    debug!("Failed to encode control message for '{}': {}", name, e);
                    continue;
                }
            };
            line.push(b'\n');

            if let Err(e) = stdin.write_all(&line).await {
                debug!("Control channel of '{}' closed: {}", name, e);
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    tx
}

/// Drop runtime flags that would open a debugger port in the child
pub fn filter_debug_args(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|arg| {
            !DEBUG_ARG_PREFIXES
                .iter()
                .any(|prefix| arg.starts_with(prefix))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_test_request(name: &str, script: PathBuf) -> LaunchRequest {
        LaunchRequest {
            name: name.to_string(),
            script,
            kind: ScriptKind::Binary,
            args: vec![],
            script_args: vec![],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            stdio: StdioMode::Pipe,
        }
    }

    #[test]
    fn test_classify_script_kinds() {
        assert_eq!(
            ScriptKind::classify(Path::new("/srv/app/main.js")).unwrap(),
            ScriptKind::Interpreted
        );
        assert_eq!(
            ScriptKind::classify(Path::new("worker.mjs")).unwrap(),
            ScriptKind::Interpreted
        );
        assert_eq!(
            ScriptKind::classify(Path::new("/usr/bin/helper")).unwrap(),
            ScriptKind::Binary
        );
        assert!(matches!(
            ScriptKind::classify(Path::new("tool.py")),
            Err(WardenError::UnsupportedScriptType(_))
        ));
    }

    #[test]
    fn test_filter_debug_args() {
        let args = vec![
            "--inspect=9229".to_string(),
            "--max-old-space-size=512".to_string(),
            "--inspect-brk".to_string(),
            "--debug-port=5858".to_string(),
        ];
        assert_eq!(filter_debug_args(&args), vec!["--max-old-space-size=512"]);
    }

    #[test]
    fn test_exit_outcome_describe() {
        assert_eq!(ExitOutcome::code(1).describe(), "exited with code 1");
        assert_eq!(ExitOutcome::signal(9).describe(), "terminated by signal 9");
        assert!(ExitOutcome::code(0).success());
        assert!(!ExitOutcome::signal(15).success());
    }

    #[test]
    fn test_control_message_encoding() {
        let encoded = serde_json::to_string(&ControlMessage::Shutdown).unwrap();
        assert_eq!(encoded, r#"{"type":"shutdown"}"#);
    }

    #[tokio::test]
    async fn test_launch_binary_captures_output() {
        let mut request = create_test_request("test-echo", PathBuf::from("/bin/echo"));
        request.args = vec!["hello".to_string(), "world".to_string()];

        let launched = TokioLauncher::new().launch(&request).unwrap();
        assert!(launched.pid > 0);
        assert!(launched.control.is_none());

        let mut stdout = launched.stdout.unwrap();
        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "hello world\n");

        let outcome = launched.exit.await.unwrap();
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_launch_with_env_and_cwd() {
        let temp_dir = TempDir::new().unwrap();
        let mut request = create_test_request("test-env", PathBuf::from("/bin/sh"));
        request.args = vec!["-c".to_string(), "echo $TEST_VAR; pwd".to_string()];
        request.cwd = temp_dir.path().to_path_buf();
        request
            .env
            .insert("TEST_VAR".to_string(), "test_value".to_string());

        let launched = TokioLauncher::new().launch(&request).unwrap();
        let mut output = String::new();
        launched
            .stdout
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();

        assert!(output.starts_with("test_value\n"));
        let _ = launched.exit.await;
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let mut request = create_test_request("test-exit", PathBuf::from("/bin/sh"));
        request.args = vec!["-c".to_string(), "exit 3".to_string()];
        request.stdio = StdioMode::Null;

        let launched = TokioLauncher::new().launch(&request).unwrap();
        assert!(launched.stdout.is_none());
        assert_eq!(launched.exit.await.unwrap(), ExitOutcome::code(3));
    }

    #[tokio::test]
    async fn test_launch_nonexistent_script() {
        let request = create_test_request("test-nonexistent", PathBuf::from("/nonexistent/script"));

        match TokioLauncher::new().launch(&request) {
            Err(WardenError::SpawnError(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("Expected SpawnError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_interpreted_without_runtime_fails() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("app.js");
        std::fs::write(&script, "console.log('hi')").unwrap();

        let mut request = create_test_request("test-script", script);
        request.kind = ScriptKind::Interpreted;

        let launcher = TokioLauncher::with_interpreter("/nonexistent/runtime");
        assert!(matches!(
            launcher.launch(&request),
            Err(WardenError::SpawnError(_))
        ));
    }
}
