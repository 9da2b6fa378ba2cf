use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandOutput, RemoteChannel, RemoteChannelFactory};
use crate::error::ChannelError;

/// Runs commands on the local machine through a shell. Stands in for an SSH
/// session when the batch system is reachable locally.
#[derive(Debug, Clone)]
pub struct LocalShell {
    shell: String,
}

impl LocalShell {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl RemoteChannel for LocalShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        tracing::debug!(shell = %self.shell, command, "exec");
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ChannelError::Exec(format!("{}: {e}", self.shell)))?;

        Ok(CommandOutput {
            // Killed by a signal: no code.
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteChannelFactory for LocalShell {
    async fn open(&self) -> Result<Arc<dyn RemoteChannel>, ChannelError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_status_and_streams() {
        let channel = LocalShell::default().open().await.unwrap();
        let out = channel.exec("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_shell_is_exec_error() {
        let channel = LocalShell::new("/nonexistent/shell");
        let err = channel.exec("true").await.unwrap_err();
        assert!(matches!(err, ChannelError::Exec(_)));
    }
}
