/// Pod log collection
///
/// Writes the logs of every pod in a namespace to `<dir>/<pod>.txt`. A pod whose
/// logs cannot be read is skipped and reported; local write failures abort.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use crate::core::cluster::{ClusterApi, ExecTarget, PodSummary};
use crate::core::error::{BackupError, Result};

/// Pods whose logs were written or skipped
#[derive(Debug, Default)]
pub struct LogsSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<String>,
    pub bytes: u64,
}

pub struct LogCollector {
    cluster: Arc<dyn ClusterApi>,
}

impl LogCollector {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn collect(&self, namespace: &str, output_dir: &Path, tail_lines: Option<i64>) -> Result<LogsSummary> {
        let pods = self.cluster.list_pods(namespace, "").await?;

        fs::create_dir_all(output_dir)
            .await
            .map_err(|e| BackupError::transfer("creating directory", output_dir, e))?;

        let mut summary = LogsSummary::default();
        for pod in pods {
            let text = match self.pod_text(namespace, &pod, tail_lines).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(pod = %pod.name, error = %e, "Skipping pod logs");
                    summary.skipped.push(pod.name);
                    continue;
                }
            };

            let path = output_dir.join(format!("{}.txt", pod.name));
            fs::write(&path, &text)
                .await
                .map_err(|e| BackupError::transfer("writing", &path, e))?;
            summary.bytes += text.len() as u64;
            summary.written.push(path);
        }

        info!(
            namespace = %namespace,
            directory = %output_dir.display(),
            pods = summary.written.len(),
            skipped = summary.skipped.len(),
            "Collected pod logs"
        );
        Ok(summary)
    }

    /// Single-container pods are written as is; otherwise each container gets a header
    async fn pod_text(&self, namespace: &str, pod: &PodSummary, tail_lines: Option<i64>) -> Result<String> {
        let target = |container: Option<&String>| ExecTarget {
            namespace: namespace.to_string(),
            pod_name: pod.name.clone(),
            container: container.cloned(),
        };

        if pod.containers.len() <= 1 {
            return self
                .cluster
                .pod_logs(&target(pod.containers.first()), tail_lines)
                .await;
        }

        let mut text = String::new();
        for container in &pod.containers {
            let logs = self.cluster.pod_logs(&target(Some(container)), tail_lines).await?;
            text.push_str(&format!("==> {} <==\n", container));
            text.push_str(&logs);
            if !logs.ends_with('\n') {
                text.push('\n');
            }
        }
        Ok(text)
    }
}
