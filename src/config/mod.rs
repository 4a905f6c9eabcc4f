use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log size that triggers rotation (10 MiB)
pub const DEFAULT_LOG_ROTATION_BYTES: u64 = 10 * 1024 * 1024;

/// How a child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// stdout/stderr are piped into output capture
    #[default]
    Pipe,
    /// The child shares the supervisor's streams; nothing is captured
    Inherit,
    /// Output is discarded
    Null,
}

/// Everything needed to launch and supervise one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Registry key; falls back to the resolved script path
    #[serde(default)]
    pub name: Option<String>,

    /// Script or executable to run; resolved from the manifest in `cwd` when absent
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Runtime arguments for interpreted scripts, placed before the script path
    #[serde(default)]
    pub script_args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// File receiving captured output; no file logging when absent
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Remove ANSI escape sequences from captured output
    #[serde(default = "default_strip_escape_codes")]
    pub strip_escape_codes: bool,

    /// Prefix logged lines with the process name
    #[serde(default)]
    pub prefix_lines: bool,

    /// Prefix logged lines with a local timestamp
    #[serde(default)]
    pub log_timestamps: bool,

    /// Echo captured lines to the supervisor's own stdout/stderr
    #[serde(default)]
    pub debug_echo: bool,

    /// Restart delays in milliseconds; the last one repeats
    #[serde(default = "default_restart_intervals")]
    pub restart_intervals_ms: Vec<u64>,

    /// Uptime after which the restart back-off resets (milliseconds)
    #[serde(default = "default_restart_grace_window")]
    pub restart_grace_window_ms: u64,

    /// Memory ceiling in bytes; exceeding it triggers a graceful restart
    #[serde(default)]
    pub memory_threshold_bytes: Option<u64>,

    #[serde(default)]
    pub stdio: StdioMode,
}

// Default value functions for serde
fn default_strip_escape_codes() -> bool {
    true
}

fn default_restart_intervals() -> Vec<u64> {
    vec![1000, 2000, 4000, 8000, 16000, 30000]
}

fn default_restart_grace_window() -> u64 {
    60_000
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            name: None,
            script: None,
            args: Vec::new(),
            script_args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            log_path: None,
            strip_escape_codes: default_strip_escape_codes(),
            prefix_lines: false,
            log_timestamps: false,
            debug_echo: false,
            restart_intervals_ms: default_restart_intervals(),
            restart_grace_window_ms: default_restart_grace_window(),
            memory_threshold_bytes: None,
            stdio: StdioMode::default(),
        }
    }
}

impl ProcessSpec {
    /// Create a spec for a named script with default policies
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: Some(name.into()),
            script: Some(script.into()),
            ..Self::default()
        }
    }

    /// Load process specs from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Vec<ProcessSpec>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let specs = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        let expanded: Vec<ProcessSpec> = specs
            .into_iter()
            .map(|mut spec| {
                spec.expand_env_vars();
                spec
            })
            .collect();

        for spec in &expanded {
            spec.validate()?;
        }

        Ok(expanded)
    }

    fn parse_toml(contents: &str) -> Result<Vec<ProcessSpec>> {
        let file: SpecFile = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        file.into_specs()
    }

    fn parse_json(contents: &str) -> Result<Vec<ProcessSpec>> {
        let file: SpecFile = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;
        file.into_specs()
    }

    /// Validate the spec before any resolution happens
    pub fn validate(&self) -> Result<()> {
        if self.script.is_none() && self.cwd.is_none() {
            return Err(WardenError::MissingConfigField("script or cwd".to_string()));
        }

        if let Some(ref name) = self.name {
            if name.trim().is_empty() {
                return Err(WardenError::MissingConfigField("name".to_string()));
            }
        }

        if let Some(ref script) = self.script {
            if script.as_os_str().is_empty() {
                return Err(WardenError::MissingConfigField("script".to_string()));
            }
        }

        if self.restart_intervals_ms.is_empty() {
            return Err(WardenError::InvalidConfig(
                "restart_intervals_ms must contain at least one delay".to_string(),
            ));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(WardenError::ConfigError(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        Ok(())
    }

    pub fn restart_intervals(&self) -> Vec<Duration> {
        self.restart_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn restart_grace_window(&self) -> Duration {
        Duration::from_millis(self.restart_grace_window_ms)
    }

    /// Expand environment variables in path-like and string fields
    fn expand_env_vars(&mut self) {
        self.script = self.script.as_deref().map(expand_env_in_path);
        self.cwd = self.cwd.as_deref().map(expand_env_in_path);
        self.log_path = self.log_path.as_deref().map(expand_env_in_path);

        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

// `processes` must be tried first: every field of a single spec is optional.
#[derive(Deserialize)]
#[serde(untagged)]
enum SpecFile {
    Multiple { processes: Vec<ProcessSpec> },
    Single(ProcessSpec),
}

impl SpecFile {
    fn into_specs(self) -> Result<Vec<ProcessSpec>> {
        match self {
            SpecFile::Single(spec) => Ok(vec![spec]),
            SpecFile::Multiple { processes } if processes.is_empty() => Err(
                WardenError::InvalidConfig("No process configuration found in file".to_string()),
            ),
            SpecFile::Multiple { processes } => Ok(processes),
        }
    }
}

/// Expand `$VAR` and `${VAR}` references in a string. A bare reference
/// takes the longest run of name characters; unset variables are left as
/// written.
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = match after.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            },
            None => {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };

        let value = if name.is_empty() {
            None
        } else {
            std::env::var(name).ok()
        };

        match value {
            Some(value) => {
                result.push_str(&value);
                rest = &after[consumed..];
            }
            None => {
                result.push('$');
                rest = after;
            }
        }
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

/// Timing knobs shared by every supervised process
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Interval between memory samples
    pub usage_poll_interval: Duration,
    /// Time a process gets to exit after a polite stop request
    pub grace_period: Duration,
    /// Log size at which the file is rotated to `<path>.old`
    pub log_rotation_bytes: u64,
    /// How long exit handling waits for output readers to drain
    pub output_drain_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            usage_poll_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(3),
            log_rotation_bytes: DEFAULT_LOG_ROTATION_BYTES,
            output_drain_timeout: Duration::from_secs(1),
        }
    }
}
