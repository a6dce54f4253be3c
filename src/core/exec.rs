/// Remote command channel
///
/// Runs commands inside a resolved target and streams their standard streams.
/// Secrets never appear in argv; commands that need one read it from stdin or
/// from the target's own environment.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::core::cluster::{ByteSink, ByteSource, ClusterApi, ExecStreams, ExecTarget};
use crate::core::error::{BackupError, Result};

/// Shell used for every scripted command
pub const SHELL: &str = "sh";

/// Copies exactly `$1` bytes from stdin into `$2`
///
/// A fixed byte count lets the remote side finish without waiting for stdin EOF.
pub const WRITE_STREAM_SCRIPT: &str = "head -c \"$1\" > \"$2\"";

/// Upper bound on the stderr kept for error messages
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

/// The command vocabulary used by the backup workflows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Stream a remote file to stdout
    ReadFile { path: String },
    /// Write `len` bytes of stdin to a remote file
    WriteStream { path: String, len: u64 },
    /// Arbitrary `sh -c` script
    Shell { script: String },
}

impl RemoteCommand {
    pub fn read_file(path: impl Into<String>) -> Self {
        Self::ReadFile { path: path.into() }
    }

    pub fn write_stream(path: impl Into<String>, len: u64) -> Self {
        Self::WriteStream {
            path: path.into(),
            len,
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell {
            script: script.into(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::ReadFile { path } => vec!["cat".to_string(), path.clone()],
            Self::WriteStream { path, len } => vec![
                SHELL.to_string(),
                "-c".to_string(),
                WRITE_STREAM_SCRIPT.to_string(),
                "cnvrgctl".to_string(),
                len.to_string(),
                path.clone(),
            ],
            Self::Shell { script } => vec![SHELL.to_string(), "-c".to_string(), script.clone()],
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path } => write!(f, "cat {}", path),
            Self::WriteStream { path, len } => write!(f, "write {} bytes to {}", len, path),
            Self::Shell { script } => write!(f, "sh -c '{}'", script),
        }
    }
}

/// Output captured from a command whose stdout was buffered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Bounded in-memory sink
///
/// Keeps at most `limit` bytes; anything beyond is dropped from the front.
#[derive(Clone)]
pub struct CaptureSink {
    buf: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl CaptureSink {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).trim().to_string()
    }
}

impl AsyncWrite for CaptureSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        buf.extend_from_slice(data);
        if buf.len() > self.limit {
            let excess = buf.len() - self.limit;
            buf.drain(..excess);
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Exec channel bound to one resolved target
#[derive(Clone)]
pub struct CommandChannel {
    cluster: Arc<dyn ClusterApi>,
    target: ExecTarget,
}

impl CommandChannel {
    pub fn new(cluster: Arc<dyn ClusterApi>, target: ExecTarget) -> Self {
        Self { cluster, target }
    }

    pub fn target(&self) -> &ExecTarget {
        &self.target
    }

    /// Run a command with stdout streamed into `stdout`
    ///
    /// Blocks until the remote process exits. Returns the captured stderr, which is
    /// informational on success.
    pub async fn run_streaming(
        &self,
        command: &RemoteCommand,
        stdin: Option<ByteSource>,
        stdout: ByteSink,
    ) -> Result<String> {
        let stderr = CaptureSink::new(STDERR_TAIL_LIMIT);
        let streams = ExecStreams {
            stdin,
            stdout,
            stderr: Box::new(stderr.clone()),
        };

        debug!(target = %self.target, command = %command, "Running remote command");
        let exit = self
            .cluster
            .exec(&self.target, &command.argv(), streams)
            .await
            .map_err(|e| match e {
                BackupError::RemoteExecution { .. } | BackupError::Transfer { .. } => e,
                other => BackupError::RemoteExecution {
                    target: self.target.to_string(),
                    command: command.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let stderr_text = stderr.text();

        if !exit.is_success() {
            let mut reason = format!("exit code {}", exit.code);
            if !stderr_text.is_empty() {
                reason.push_str(": ");
                reason.push_str(&stderr_text);
            } else if let Some(message) = exit.message {
                reason.push_str(": ");
                reason.push_str(&message);
            }
            return Err(BackupError::RemoteExecution {
                target: self.target.to_string(),
                command: command.to_string(),
                reason,
            });
        }

        if !stderr_text.is_empty() {
            warn!(target = %self.target, command = %command, stderr = %stderr_text, "Remote command wrote to stderr");
        }

        Ok(stderr_text)
    }

    /// Run a command and buffer its stdout; for commands with small output
    pub async fn run(&self, command: &RemoteCommand, stdin: Option<ByteSource>) -> Result<CommandOutput> {
        let stdout = CaptureSink::new(usize::MAX);
        let stderr = self
            .run_streaming(command, stdin, Box::new(stdout.clone()))
            .await?;
        Ok(CommandOutput {
            stdout: stdout.contents(),
            stderr,
        })
    }
}
