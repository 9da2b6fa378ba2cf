//! Remote execution channel.
//!
//! The engine only needs to run commands on the remote side; session setup
//! and authentication live behind [`RemoteChannelFactory`].

mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use local::LocalShell;

/// Output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// An authenticated remote session.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ChannelError>;
}

/// Produces sessions on demand. Shared by every job and module, so
/// implementations must tolerate concurrent `open` calls.
#[async_trait]
pub trait RemoteChannelFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn RemoteChannel>, ChannelError>;
}
