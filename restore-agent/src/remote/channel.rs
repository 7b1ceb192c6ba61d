//! Framing for the Kubernetes `v4.channel.k8s.io` exec subprotocol.
//!
//! Every binary WebSocket message starts with one byte naming the stream it
//! belongs to. The error channel carries a single `metav1.Status` JSON object
//! once the command has finished.

use super::ExecOutput;
use crate::utils::{RestoreError, Result};
use serde::Deserialize;

/// Subprotocol negotiated with the API server
pub const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";

pub const STDIN_CHANNEL: u8 = 0;
pub const STDOUT_CHANNEL: u8 = 1;
pub const STDERR_CHANNEL: u8 = 2;
pub const ERROR_CHANNEL: u8 = 3;

/// `metav1.Status` as sent on the error channel
#[derive(Debug, Clone, Deserialize)]
pub struct ExecStatus {
    pub status: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusCause {
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

impl ExecStatus {
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }

    /// Exit code of the remote process, if the status carries one
    pub fn exit_code(&self) -> Option<i32> {
        if self.is_success() {
            return Some(0);
        }
        if self.reason != "NonZeroExitCode" {
            return None;
        }
        self.details
            .as_ref()?
            .causes
            .iter()
            .find(|cause| cause.reason == "ExitCode")
            .and_then(|cause| cause.message.trim().parse().ok())
    }
}

/// Prefix a stdin chunk with its channel byte.
pub fn encode_stdin(chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(chunk.len() + 1);
    frame.push(STDIN_CHANNEL);
    frame.extend_from_slice(chunk);
    frame
}

/// Accumulates the demultiplexed streams of one exec session.
#[derive(Debug, Default)]
pub struct ChannelBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: Vec<u8>,
}

impl ChannelBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one binary frame to its stream. Unknown channels are ignored.
    pub fn push(&mut self, frame: &[u8]) {
        let Some((&channel, payload)) = frame.split_first() else {
            return;
        };
        match channel {
            STDOUT_CHANNEL => self.stdout.extend_from_slice(payload),
            STDERR_CHANNEL => self.stderr.extend_from_slice(payload),
            ERROR_CHANNEL => self.status.extend_from_slice(payload),
            _ => {}
        }
    }

    /// Turn the collected streams into the command's outcome.
    ///
    /// A session that closed without a status is treated as success with an
    /// unknown exit code.
    pub fn finish(self) -> Result<ExecOutput> {
        let stdout = String::from_utf8_lossy(&self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();

        if self.status.iter().all(u8::is_ascii_whitespace) {
            return Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: None,
            });
        }

        let status: ExecStatus = serde_json::from_slice(&self.status)?;
        if status.is_success() {
            return Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: Some(0),
            });
        }

        match status.exit_code() {
            Some(code) => Err(RestoreError::command(Some(code), &stdout, &stderr)),
            None => Err(RestoreError::Command {
                exit_code: None,
                message: if status.message.is_empty() {
                    status.reason
                } else {
                    status.message
                },
                stdout,
                stderr,
            }),
        }
    }
}
