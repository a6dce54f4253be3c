/// Local artifact transfer over the remote command channel
///
/// Pull streams a remote file into a local directory; push streams a local file
/// into the target. Both go through bounded buffers.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{BufReader, BufWriter};
use tracing::info;

use crate::core::cluster::{ByteSink, ByteSource};
use crate::core::error::{BackupError, Result};
use crate::core::exec::{CommandChannel, RemoteCommand};

const TRANSFER_BUFFER: usize = 64 * 1024;

/// One dump file moved between the target and local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub file_name: String,
    pub local_directory: PathBuf,
    pub remote_path: String,
}

impl BackupArtifact {
    pub fn new(file_name: impl Into<String>, local_directory: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            local_directory: local_directory.into(),
            remote_path: remote_path.into(),
        }
    }

    pub fn local_path(&self) -> PathBuf {
        self.local_directory.join(&self.file_name)
    }
}

/// Download `remote_path` into `local_directory/file_name`, returning the byte count
///
/// An existing local file is truncated.
pub async fn pull(channel: &CommandChannel, remote_path: &str, local_directory: &Path, file_name: &str) -> Result<u64> {
    fs::create_dir_all(local_directory)
        .await
        .map_err(|e| BackupError::transfer("creating directory", local_directory, e))?;

    let destination = local_directory.join(file_name);
    let file = File::create(&destination)
        .await
        .map_err(|e| BackupError::transfer("creating", &destination, e))?;

    receive(
        channel,
        remote_path,
        Box::new(BufWriter::with_capacity(TRANSFER_BUFFER, file)),
        &destination,
    )
    .await?;

    let size = fs::metadata(&destination)
        .await
        .map_err(|e| BackupError::transfer("reading size of", &destination, e))?
        .len();

    info!(
        target = %channel.target(),
        remote = %remote_path,
        local = %destination.display(),
        bytes = size,
        "Pulled artifact"
    );
    Ok(size)
}

/// Upload `local_file` to `remote_destination`, returning the byte count
///
/// Returns only after the remote side has written every byte.
pub async fn push(channel: &CommandChannel, local_file: &Path, remote_destination: &str) -> Result<u64> {
    let file = File::open(local_file)
        .await
        .map_err(|e| BackupError::transfer("opening", local_file, e))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| BackupError::transfer("reading size of", local_file, e))?
        .len();

    send(
        channel,
        Box::new(BufReader::with_capacity(TRANSFER_BUFFER, file)),
        size,
        remote_destination,
        local_file,
    )
    .await?;

    info!(
        target = %channel.target(),
        local = %local_file.display(),
        remote = %remote_destination,
        bytes = size,
        "Pushed artifact"
    );
    Ok(size)
}

/// Stream a remote file into `sink`; local write failures are reported against `destination`
async fn receive(channel: &CommandChannel, remote_path: &str, sink: ByteSink, destination: &Path) -> Result<()> {
    channel
        .run_streaming(&RemoteCommand::read_file(remote_path), None, sink)
        .await
        .map(|_| ())
        .map_err(|e| local_path_error(e, "writing", destination))
}

async fn send(
    channel: &CommandChannel,
    source: ByteSource,
    len: u64,
    remote_destination: &str,
    local_file: &Path,
) -> Result<()> {
    channel
        .run_streaming(
            &RemoteCommand::write_stream(remote_destination, len),
            Some(source),
            Box::new(tokio::io::sink()),
        )
        .await
        .map(|_| ())
        .map_err(|e| local_path_error(e, "reading", local_file))
}

fn local_path_error(err: BackupError, operation: &str, path: &Path) -> BackupError {
    match err {
        BackupError::Transfer { source, .. } => BackupError::transfer(operation, path, source),
        other => other,
    }
}
