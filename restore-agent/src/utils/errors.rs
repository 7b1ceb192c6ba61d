//! Custom error types for the restore agent.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or protocol failure reaching the pod or the artifact store.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {timeout:?}: {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote command ran but reported failure.
    #[error("Command failed (exit code {exit_code:?}): {message}")]
    Command {
        exit_code: Option<i32>,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Download failed after {attempts} attempts: {source}")]
    DownloadExhausted {
        attempts: u32,
        #[source]
        source: Box<RestoreError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl RestoreError {
    /// Build a `Command` error from the output of a failed remote run.
    pub fn command(exit_code: Option<i32>, stdout: &str, stderr: &str) -> Self {
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        RestoreError::Command {
            exit_code,
            message,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Classify a failed HTTP call, keeping deadline expiry distinct from
    /// other transport errors.
    pub fn http(operation: impl Into<String>, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RestoreError::Timeout {
                operation: operation.into(),
                timeout,
            }
        } else {
            RestoreError::Http(err)
        }
    }

    /// Rebuild an error of the same kind, for failures that are cached and
    /// reported again on every later call. Client-library errors that cannot
    /// be copied become `Connection` with the same message.
    pub fn replay(&self) -> RestoreError {
        match self {
            RestoreError::Config(m) => RestoreError::Config(m.clone()),
            RestoreError::Connection(m) => RestoreError::Connection(m.clone()),
            RestoreError::Timeout { operation, timeout } => RestoreError::Timeout {
                operation: operation.clone(),
                timeout: *timeout,
            },
            RestoreError::NotFound(m) => RestoreError::NotFound(m.clone()),
            RestoreError::Command {
                exit_code,
                message,
                stdout,
                stderr,
            } => RestoreError::Command {
                exit_code: *exit_code,
                message: message.clone(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
            RestoreError::Validation(m) => RestoreError::Validation(m.clone()),
            RestoreError::DownloadExhausted { attempts, source } => RestoreError::DownloadExhausted {
                attempts: *attempts,
                source: Box::new(source.replay()),
            },
            RestoreError::Io(e) => RestoreError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RestoreError::Http(e) => RestoreError::Connection(e.to_string()),
            RestoreError::Serialization(e) => RestoreError::Connection(e.to_string()),
            RestoreError::Cancelled(m) => RestoreError::Cancelled(m.clone()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RestoreError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
