//! Remote command-execution transport
//!
//! Pools talk to remote hosts only through [`RemoteConnector`] and
//! [`RemoteSession`]; the SSH implementation lives in [`crate::ssh`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RemoteConfig;
use crate::Result;

/// Raw output of a command that ran to completion on the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status, `None` when the channel closed without reporting one
    pub exit_code: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Result of `execute_command`. A non-zero exit is a failed result, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: Option<u32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn from_output(output: ExecOutput, duration: Duration) -> Self {
        Self {
            success: output.success(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Per-call overrides for command execution
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions {
    /// Hard timeout; the pool's `command_timeout_secs` when unset
    pub timeout: Option<Duration>,
    /// Wait between interrupt and forced close; the pool's `kill_grace_secs` when unset
    pub grace: Option<Duration>,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            grace: None,
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }
}

/// One live remote connection
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command and collect its output
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Write `contents` to `remote_path`, returning the number of bytes sent
    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<u64>;

    /// Read the file at `remote_path`
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>>;

    /// Ask the running command (if any) to terminate
    fn interrupt(&self);

    /// Close the connection. Any command still running is abandoned.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens sessions for an environment's remote configuration
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, environment: &str, config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>>;
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
