/// Exec/tunnel target resolution
///
/// Finds the single running pod whose `labelKey` label equals the deployment name.

use std::sync::Arc;

use tracing::debug;

use crate::core::cluster::{ClusterApi, ExecTarget};
use crate::core::error::{BackupError, Result};

/// What to look for when resolving a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSelector {
    pub namespace: String,
    pub deployment: String,
    pub label_key: String,
    pub container: Option<String>,
}

impl TargetSelector {
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployment: deployment.into(),
            label_key: label_key.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }

    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label_key, self.deployment)
    }
}

/// A resolved target plus the pod IP reported at resolution time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target: ExecTarget,
    pub pod_ip: Option<String>,
}

#[derive(Clone)]
pub struct TargetResolver {
    cluster: Arc<dyn ClusterApi>,
}

impl TargetResolver {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn resolve(&self, selector: &TargetSelector) -> Result<ResolvedTarget> {
        let label_selector = selector.label_selector();
        let pods = self
            .cluster
            .list_pods(&selector.namespace, &label_selector)
            .await?;

        let mut running: Vec<_> = pods.into_iter().filter(|p| p.is_running()).collect();

        match running.len() {
            0 => Err(BackupError::NoMatch {
                namespace: selector.namespace.clone(),
                selector: label_selector,
            }),
            1 => {
                let pod = running.remove(0);
                debug!(
                    namespace = %selector.namespace,
                    pod = %pod.name,
                    ip = pod.pod_ip.as_deref().unwrap_or("unknown"),
                    "Resolved target"
                );
                Ok(ResolvedTarget {
                    target: ExecTarget {
                        namespace: selector.namespace.clone(),
                        pod_name: pod.name,
                        container: selector.container.clone(),
                    },
                    pod_ip: pod.pod_ip,
                })
            }
            _ => Err(BackupError::AmbiguousTarget {
                namespace: selector.namespace.clone(),
                selector: label_selector,
                candidates: running.into_iter().map(|p| p.name).collect(),
            }),
        }
    }
}
