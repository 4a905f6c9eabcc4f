use crate::error::{Result, WardenError};
use crate::logs::capture::{CapturedLine, OutputStream};
use chrono::Local;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Appends lines to a single log file, rotating it to `<path>.old` once it
/// reaches the size threshold.
///
/// Every append re-stats the file instead of tracking its size, so files
/// truncated or rotated by someone else are picked up on the next line.
#[derive(Debug, Clone)]
pub struct LogWriter {
    path: PathBuf,
    rotation_bytes: u64,
}

impl LogWriter {
    pub fn new(path: impl Into<PathBuf>, rotation_bytes: u64) -> Self {
        Self {
            path: path.into(),
            rotation_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the single backup generation
    pub fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".old");
        PathBuf::from(backup)
    }

    /// Append one already formatted entry.
    ///
    /// Stat and rename failures are logged and do not prevent the append;
    /// only a failed write is returned.
    pub async fn append(&self, entry: &str) -> Result<()> {
        if let Err(e) = self.rotate_if_needed().await {
            warn!("{}", e);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                WardenError::LogError(format!(
                    "Failed to open log {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to write to log: {}", e)))?;

        file.flush()
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to flush log: {}", e)))?;

        Ok(())
    }

    /// Rename the log aside when it has reached the threshold.
    /// Returns whether a rotation happened.
    async fn rotate_if_needed(&self) -> Result<bool> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(WardenError::LogRotationError(format!(
                    "Failed to stat {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if size < self.rotation_bytes {
            return Ok(false);
        }

        // rename(2) replaces an existing backup atomically
        tokio::fs::rename(&self.path, self.backup_path())
            .await
            .map_err(|e| {
                WardenError::LogRotationError(format!(
                    "Failed to rotate {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        Ok(true)
    }
}

enum SinkMessage {
    Entry(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to a background task that writes entries in submission order
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl std::fmt::Debug for SinkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkMessage::Entry(entry) => f.debug_tuple("Entry").field(entry).finish(),
            SinkMessage::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl LogSink {
    /// Spawn the writer task on the current runtime
    pub fn spawn(writer: LogWriter) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkMessage>();

        tokio::spawn(async move {
            if let Some(parent) = writer.path().parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        warn!("Failed to create log directory {}: {}", parent.display(), e);
                    }
                }
            }

            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Entry(entry) => {
                        if let Err(e) = writer.append(&entry).await {
                            warn!("{}", e);
                        }
                    }
                    SinkMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    pub fn write(&self, entry: String) {
        // The task only ends once every sender is gone
        let _ = self.tx.send(SinkMessage::Entry(entry));
    }

    /// Resolve once every entry submitted before this call has been handled
    pub async fn flushed(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Writes echoed lines to a stdout/stderr pair from a background task, so a
/// slow or full terminal never holds up the caller.
#[derive(Debug, Clone)]
pub struct EchoSink {
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
}

impl EchoSink {
    /// Echo to the supervisor's own stdout and stderr
    pub fn stdio() -> Self {
        Self::spawn(tokio::io::stdout(), tokio::io::stderr())
    }

    /// Spawn the echo task on the current runtime
    pub fn spawn<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();

        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut stderr = stderr;

            while let Some((stream, line)) = rx.recv().await {
                let result = match stream {
                    OutputStream::Stdout => write_line(&mut stdout, &line).await,
                    OutputStream::Stderr => write_line(&mut stderr, &line).await,
                };
                if let Err(e) = result {
                    warn!("Failed to echo {} line: {}", stream, e);
                }
            }
        });

        Self { tx }
    }

    pub fn echo(&self, stream: OutputStream, line: String) {
        let _ = self.tx.send((stream, line));
    }
}

async fn write_line<W>(target: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    target.write_all(line.as_bytes()).await?;
    target.write_all(b"\n").await?;
    target.flush().await
}

/// Routes captured lines of one process to its log file and debug echo
#[derive(Debug)]
pub struct OutputSink {
    name: String,
    prefix_lines: bool,
    timestamps: bool,
    log: Option<LogSink>,
    echo: Option<EchoSink>,
}

impl OutputSink {
    pub fn new(
        name: impl Into<String>,
        prefix_lines: bool,
        timestamps: bool,
        log: Option<LogSink>,
        echo: Option<EchoSink>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix_lines,
            timestamps,
            log,
            echo,
        }
    }

    /// Hand a line to the log and echo tasks; neither depends on the other
    pub fn emit(&self, line: &CapturedLine) {
        if let Some(ref log) = self.log {
            log.write(self.format_entry(&line.text));
        }

        if let Some(ref echo) = self.echo {
            echo.echo(line.stream, self.prefixed(&line.text));
        }
    }

    fn prefixed(&self, text: &str) -> String {
        if self.prefix_lines {
            format!("[{}] {}", self.name, text)
        } else {
            text.to_string()
        }
    }

    /// Format: `[YYYY-MM-DD HH:MM:SS.mmm] [name] text\n`, optional parts omitted
    fn format_entry(&self, text: &str) -> String {
        let body = self.prefixed(text);
        if self.timestamps {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            format!("[{}] {}\n", timestamp, body)
        } else {
            format!("{}\n", body)
        }
    }
}
