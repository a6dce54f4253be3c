/// Directory tree <-> bucket synchronization
///
/// Upload walks the local root and puts every regular file under its relative path;
/// download lists the bucket and writes each object under the local root. Neither
/// direction is transactional: a failure stops the walk and leaves what was already
/// transferred in place.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::core::error::{BackupError, Result};
use crate::core::storage::ObjectStoreClient;

/// Result of one sync run
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub transferred: usize,
    pub bytes: u64,
    pub error: Option<BackupError>,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a failed outcome into its triggering error
    pub fn into_result(self) -> Result<SyncOutcome> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Object key for a path relative to the sync root, always `/`-separated
pub fn object_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Local path for an object key, rejecting keys that would escape the root
pub fn local_path_for(root: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || key.is_empty() {
        return Err(BackupError::transfer(
            format!("refusing object key '{}' when writing under", key),
            root,
            "key is empty, absolute or contains '..'",
        ));
    }
    Ok(root.join(relative))
}

pub struct ObjectSync {
    store: Arc<dyn ObjectStoreClient>,
    show_progress: bool,
}

impl ObjectSync {
    pub fn new(store: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            store,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress(&self, len: u64, verb: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map(|s| s.progress_chars("##-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!("{} {}", verb, self.store.bucket()));
        pb
    }

    /// Upload every regular file under `local_root`
    pub async fn sync_up(&self, local_root: &Path) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();

        let files = match collect_files(local_root) {
            Ok(files) => files,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };

        let pb = self.progress(files.len() as u64, "uploading to");
        for (path, key) in files {
            pb.set_message(key.clone());
            match self.store.put(&key, &path).await {
                Ok(bytes) => {
                    outcome.transferred += 1;
                    outcome.bytes += bytes;
                    pb.inc(1);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Upload failed, stopping sync");
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        pb.finish_and_clear();

        info!(
            bucket = %self.store.bucket(),
            root = %local_root.display(),
            files = outcome.transferred,
            bytes = outcome.bytes,
            succeeded = outcome.succeeded(),
            "Upload sync finished"
        );
        outcome
    }

    /// Download every object in the bucket under `local_root`
    pub async fn sync_down(&self, local_root: &Path) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();

        let objects = match self.store.list().await {
            Ok(objects) => objects,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };

        let pb = self.progress(objects.len() as u64, "downloading from");
        for object in objects {
            // Directory placeholders carry no content
            if object.key.ends_with('/') {
                pb.inc(1);
                continue;
            }
            pb.set_message(object.key.clone());
            match self.download(local_root, &object.key).await {
                Ok(bytes) => {
                    outcome.transferred += 1;
                    outcome.bytes += bytes;
                    pb.inc(1);
                }
                Err(e) => {
                    warn!(key = %object.key, error = %e, "Download failed, stopping sync");
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        pb.finish_and_clear();

        info!(
            bucket = %self.store.bucket(),
            root = %local_root.display(),
            files = outcome.transferred,
            bytes = outcome.bytes,
            succeeded = outcome.succeeded(),
            "Download sync finished"
        );
        outcome
    }

    async fn download(&self, local_root: &Path, key: &str) -> Result<u64> {
        let destination = local_path_for(local_root, key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::transfer("creating directory", parent, e))?;
        }
        self.store.get(key, &destination).await
    }
}

/// Regular files under `root` with their object keys, in walk order
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| BackupError::transfer("walking", root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| BackupError::transfer("resolving relative path under", root, e))?;
        files.push((entry.path().to_path_buf(), object_key(relative)));
    }
    Ok(files)
}
