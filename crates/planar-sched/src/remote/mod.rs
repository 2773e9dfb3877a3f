//! Remote host access: shell commands and SFTP file operations.
//!
//! [`RemoteSession`] is the seam between the dispatcher and the transport.
//! [`SshSession`] talks to a real host; [`MockSession`] keeps an in-memory
//! filesystem for tests and dry runs.

mod mock;
mod ssh;

pub use mock::{MockConnector, MockSession, MockSnapshot};
pub use ssh::{SshConnector, SshSession};

use std::path::Path;

use async_trait::async_trait;

use crate::error::DispatchResult;

/// Output of a remote shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Exit status reported by the remote shell.
    pub exit_status: i32,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// First line of standard output, trimmed.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// Metadata returned by a remote stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    /// Whether the path is a directory.
    pub is_dir: bool,

    /// Size in bytes, when the server reports one.
    pub size: Option<u64>,
}

/// An authenticated session on one remote host.
///
/// All paths are forward-slash remote paths. Relative paths resolve against
/// the remote login directory.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command and collect its output.
    async fn exec(&self, command: &str) -> DispatchResult<CommandOutput>;

    /// Stat a remote path. A missing path yields
    /// [`DispatchError::RemoteNotFound`](crate::DispatchError::RemoteNotFound).
    async fn stat(&self, path: &str) -> DispatchResult<RemoteStat>;

    /// Create a single remote directory.
    async fn mkdir(&self, path: &str) -> DispatchResult<()>;

    /// Copy a local file to a remote path, returning the bytes written.
    async fn upload(&self, local: &Path, remote: &str) -> DispatchResult<u64>;

    /// Close the file-transfer channel and the session.
    async fn close(&self) -> DispatchResult<()>;
}
