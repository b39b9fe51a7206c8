use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Both a source and a destination folder are required")]
    MissingPath,

    #[error("Custom backup name is empty")]
    EmptyName,

    #[error("Could not remove existing directory {path}: {detail}")]
    RemovalFailed { path: PathBuf, detail: String },

    #[error("Could not create backup directory {path}: {detail}")]
    DirectoryCreateFailed { path: PathBuf, detail: String },

    #[error("No fast copy tool is supported on this platform ({os})")]
    UnsupportedPlatform { os: String },

    #[error("Could not launch {tool}: {detail}")]
    ToolLaunch { tool: String, detail: String },

    #[error("Backup failed with exit code {exit_code}:\n{diagnostic}")]
    CopyToolFailure {
        tool: String,
        exit_code: i32,
        diagnostic: String,
    },

    #[error("A backup is already running")]
    Busy,

    #[error("Backup operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Backup worker failed: {message}")]
    Worker { message: String },
}

impl BackupError {
    /// Create a configuration error with a custom message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error with a custom message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// True for errors raised before any directory was touched
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            BackupError::MissingPath
                | BackupError::EmptyName
                | BackupError::Validation { .. }
                | BackupError::Busy
        )
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Cancelled => 130,
            BackupError::MissingPath
            | BackupError::EmptyName
            | BackupError::Validation { .. }
            | BackupError::Config { .. } => 2,
            _ => 1,
        }
    }

    /// Provide helpful suggestions for resolving the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            BackupError::EmptyName => vec![
                "Pass a non-empty name with --name".to_string(),
                "Use --auto to let versions be numbered v1, v2, ...".to_string(),
            ],
            BackupError::RemovalFailed { path, .. } => vec![
                format!("Check that nothing holds files open under {}", path.display()),
                "Choose a different custom name".to_string(),
            ],
            BackupError::DirectoryCreateFailed { .. } => vec![
                "Check that the destination folder is writable".to_string(),
                "Ensure the destination drive is mounted".to_string(),
            ],
            BackupError::UnsupportedPlatform { .. } => vec![
                "Set rsync_path in config.ini to a compatible sync tool".to_string(),
            ],
            BackupError::ToolLaunch { tool, .. } => vec![
                format!("Install {tool} or make sure it is on PATH"),
                "Point rsync_path / robocopy_path in config.ini at the tool".to_string(),
            ],
            BackupError::CopyToolFailure { .. } => vec![
                "Inspect the diagnostic output above".to_string(),
                "The partial backup folder was left in place; remove it manually".to_string(),
            ],
            _ => vec![],
        }
    }
}
