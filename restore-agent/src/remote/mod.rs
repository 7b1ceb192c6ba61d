//! Remote command execution inside the IoTDB pod.
//!
//! [`RemoteExecutor`] is the only way the restore pipeline touches the target:
//! every extraction, deletion, discovery and load runs as `sh -c "<command>"`
//! through it. The production implementation is [`kube::KubeExecutor`], which
//! speaks the Kubernetes `exec` WebSocket protocol.

pub mod access;
pub mod channel;
pub mod kube;

use crate::utils::{RestoreError, Result};
use std::future::Future;
use std::path::Path;

pub use access::ClusterAccess;
pub use kube::KubeExecutor;

/// Captured output of a completed remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,

    /// Exit status reported by the target, when it reported one
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }
}

/// Executes shell commands in a remote execution target.
///
/// A non-zero exit status is reported as [`RestoreError::Command`]; transport
/// failures as [`RestoreError::Connection`]; an exceeded deadline as
/// [`RestoreError::Timeout`].
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` through `sh -c` and capture its output.
    fn execute(&self, command: &str) -> impl Future<Output = Result<ExecOutput>> + Send;

    /// Copy a local file to `remote_path` inside the target.
    fn upload(&self, local_path: &Path, remote_path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check whether a regular file exists in the target.
    fn file_exists(&self, path: &str) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let command = format!(
                "[ -f {} ] && echo 'exists' || echo 'not exists'",
                shell_quote(path)
            );
            let output = self.execute(&command).await?;
            Ok(output.stdout.trim() == "exists")
        }
    }

    /// Size in bytes of a file in the target (`0` when it does not exist).
    fn file_size(&self, path: &str) -> impl Future<Output = Result<u64>> + Send {
        async move {
            let quoted = shell_quote(path);
            let command = format!(
                "stat -c%s {quoted} 2>/dev/null || stat -f%z {quoted} 2>/dev/null || echo '0'"
            );
            let output = self.execute(&command).await?;
            parse_size(&output.stdout)
                .ok_or_else(|| RestoreError::command(output.exit_code, &output.stdout, "unexpected stat output"))
        }
    }
}

/// Quote a value for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn parse_size(stdout: &str) -> Option<u64> {
    stdout.lines().next().and_then(|line| line.trim().parse().ok())
}


#[cfg(test)]
mod tests {
    use super::testing::{ok, ScriptedExecutor};
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a.tar.gz"), "'/tmp/a.tar.gz'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_combined_output() {
        let output = ExecOutput {
            stdout: "Load successfully".to_string(),
            stderr: "warning".to_string(),
            exit_code: Some(0),
        };
        assert_eq!(output.combined(), "Load successfully\nwarning");
    }

    #[tokio::test]
    async fn test_file_exists_parses_marker() {
        let executor = ScriptedExecutor::new(|cmd| {
            if cmd.contains("present") {
                ok("exists\n")
            } else {
                ok("not exists\n")
            }
        });

        assert!(executor.file_exists("/tmp/present.tar.gz").await.unwrap());
        assert!(!executor.file_exists("/tmp/missing.tar.gz").await.unwrap());
        assert!(executor.commands()[0].starts_with("[ -f '/tmp/present.tar.gz' ]"));
    }

    #[tokio::test]
    async fn test_file_size_parses_stat_output() {
        let executor = ScriptedExecutor::new(|_| ok("1048576\n"));
        assert_eq!(executor.file_size("/tmp/a.tar.gz").await.unwrap(), 1_048_576);
    }

    #[tokio::test]
    async fn test_file_size_rejects_garbage() {
        let executor = ScriptedExecutor::new(|_| ok("stat: not found\n"));
        let err = executor.file_size("/tmp/a.tar.gz").await.unwrap_err();
        assert!(matches!(err, RestoreError::Command { .. }));
    }

    #[tokio::test]
    async fn test_file_exists_propagates_transport_errors() {
        let executor = ScriptedExecutor::new(|_| Err(RestoreError::Connection("stream reset".into())));
        let err = executor.file_exists("/tmp/a").await.unwrap_err();
        assert!(matches!(err, RestoreError::Connection(_)));
    }
}
