use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors, returned synchronously from `start`
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Failed to resolve script: {0}")]
    ResolutionError(String),

    #[error("Unsupported script type: {0}")]
    UnsupportedScriptType(String),

    #[error("Process already exists: {0}")]
    ProcessAlreadyExists(String),

    // Process lifecycle errors, reported through the event channel
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to terminate process {0}: {1}")]
    TerminationError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Monitoring errors, logged only
    #[error("Usage sampling failed: {0}")]
    MonitorError(String),

    // Log-related errors, logged only
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Log rotation failed: {0}")]
    LogRotationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Supervisor is no longer running")]
    SupervisorClosed,
}

impl WardenError {
    /// Whether this error belongs to the configuration class, which is the
    /// only class surfaced synchronously to a `start` caller.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WardenError::ConfigError(_)
                | WardenError::InvalidConfig(_)
                | WardenError::MissingConfigField(_)
                | WardenError::ResolutionError(_)
                | WardenError::UnsupportedScriptType(_)
                | WardenError::ProcessAlreadyExists(_)
        )
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
