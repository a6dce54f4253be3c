/// Workload scaling around a maintenance window
///
/// Scales a fixed, ordered list of deployments to a replica count and polls the
/// scale subresource until every workload reports that count. Scaling to zero also
/// waits for terminating pods to disappear.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::cluster::ClusterApi;
use crate::core::error::{BackupError, Result};
use crate::utils::constants::DEFAULT_LABEL_KEY;

/// Workloads to scale, in dependency order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub namespace: String,
    pub workloads: Vec<String>,
    pub replicas: i32,
}

impl ScaleTarget {
    pub fn new(namespace: impl Into<String>, workloads: &[String], replicas: i32) -> Self {
        Self {
            namespace: namespace.into(),
            workloads: workloads.to_vec(),
            replicas,
        }
    }
}

/// Replica count written for one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleReport {
    pub workload: String,
    pub previous: i32,
    pub applied: i32,
}

#[derive(Clone)]
pub struct WorkloadScaler {
    cluster: Arc<dyn ClusterApi>,
    timeout: Duration,
    poll_interval: Duration,
}

impl WorkloadScaler {
    pub fn new(cluster: Arc<dyn ClusterApi>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            cluster,
            timeout,
            poll_interval,
        }
    }

    /// Write the desired replica count to each workload in list order
    ///
    /// Stops at the first workload that cannot be read or written. Workloads
    /// already scaled are left as they are.
    pub async fn scale_to(&self, target: &ScaleTarget) -> Result<Vec<ScaleReport>> {
        let mut reports = Vec::with_capacity(target.workloads.len());

        for workload in &target.workloads {
            let current = self
                .cluster
                .get_scale(&target.namespace, workload)
                .await
                .map_err(|e| BackupError::transport(format!("scaling workload {}", workload), e))?;

            let applied = self
                .cluster
                .set_scale(&target.namespace, workload, target.replicas)
                .await
                .map_err(|e| BackupError::transport(format!("scaling workload {}", workload), e))?;

            info!(
                namespace = %target.namespace,
                workload = %workload,
                from = current.desired,
                to = applied.desired,
                "Scaled workload"
            );

            reports.push(ScaleReport {
                workload: workload.clone(),
                previous: current.desired,
                applied: applied.desired,
            });
        }

        Ok(reports)
    }

    /// Poll until every workload reports the target replica count
    ///
    /// For a target of zero, pods with a deletion timestamp still count: the scale
    /// status drops them before they release their files.
    pub async fn wait_for_convergence(&self, target: &ScaleTarget) -> Result<()> {
        let started = Instant::now();

        loop {
            let mut pending = Vec::new();
            for workload in &target.workloads {
                let count = self
                    .cluster
                    .get_scale(&target.namespace, workload)
                    .await
                    .map_err(|e| {
                        BackupError::transport(format!("waiting for workload {}", workload), e)
                    })?;
                if count.current != target.replicas {
                    pending.push(format!("{} ({} running)", workload, count.current));
                } else if target.replicas == 0 {
                    let selector = count
                        .selector
                        .unwrap_or_else(|| format!("{}={}", DEFAULT_LABEL_KEY, workload));
                    let remaining = self
                        .cluster
                        .list_pods(&target.namespace, &selector)
                        .await
                        .map_err(|e| {
                            BackupError::transport(format!("waiting for pods of workload {}", workload), e)
                        })?
                        .len();
                    if remaining > 0 {
                        pending.push(format!("{} ({} pods left)", workload, remaining));
                    }
                }
            }

            if pending.is_empty() {
                debug!(namespace = %target.namespace, replicas = target.replicas, "Workloads converged");
                return Ok(());
            }

            if started.elapsed() >= self.timeout {
                return Err(BackupError::timeout(
                    format!(
                        "workloads in {} to reach {} replicas, still pending: {}",
                        target.namespace,
                        target.replicas,
                        pending.join(", ")
                    ),
                    self.timeout,
                ));
            }

            debug!(pending = %pending.join(", "), "Waiting for workloads to converge");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn scale_and_wait(&self, target: &ScaleTarget) -> Result<Vec<ScaleReport>> {
        let reports = self.scale_to(target).await?;
        self.wait_for_convergence(target).await?;
        Ok(reports)
    }
}
