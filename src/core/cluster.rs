/// Kubernetes control-plane integration
///
/// `ClusterApi` is the only surface the engine uses to talk to the cluster:
/// scale subresources, pod listing, exec, port-forward, secrets and pod deletion.
/// `KubeCluster` implements it on top of kube-rs; tests substitute a fake.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::core::error::{BackupError, Result};

/// The pod (and optionally container) that receives exec and port-forward sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod_name: String,
    pub container: Option<String>,
}

impl fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)?;
        if let Some(container) = &self.container {
            write!(f, " (container {})", container)?;
        }
        Ok(())
    }
}

/// Pod as returned by a label-selector listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
    pub terminating: bool,
    pub containers: Vec<String>,
}

impl PodSummary {
    pub fn is_running(&self) -> bool {
        !self.terminating && self.phase.as_deref() == Some("Running")
    }
}

/// Replica counts from a deployment's scale subresource
///
/// `current` excludes pods that are still terminating; `selector` finds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCount {
    pub desired: i32,
    pub current: i32,
    pub selector: Option<String>,
}

impl ReplicaCount {
    fn from_scale(scale: Scale, fallback_desired: i32) -> Self {
        let desired = scale.spec.and_then(|s| s.replicas).unwrap_or(fallback_desired);
        let (current, selector) = scale
            .status
            .map(|s| (s.replicas, s.selector))
            .unwrap_or((0, None));
        Self {
            desired,
            current,
            selector,
        }
    }
}

/// Exit status of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitStatus {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: None,
        }
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Standard streams attached to one remote command
pub struct ExecStreams {
    pub stdin: Option<ByteSource>,
    pub stdout: ByteSink,
    pub stderr: ByteSink,
}

pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexIo for T {}

/// Raw byte stream connected to a port inside a pod
pub type PortStream = Box<dyn DuplexIo>;

const RELAY_BUFFER: usize = 64 * 1024;

/// Which end of an exec stream broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    /// Caller-supplied source or sink on this machine
    Local,
    /// The exec websocket
    Remote,
}

/// Copy `source` into `sink` until EOF and flush, tagging a failure with the side it came from
pub async fn relay<R, W>(
    source: &mut R,
    sink: &mut W,
    source_side: StreamSide,
    sink_side: StreamSide,
) -> std::result::Result<u64, (StreamSide, std::io::Error)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await.map_err(|e| (source_side, e))?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await.map_err(|e| (sink_side, e))?;
        total += n as u64;
    }
    sink.flush().await.map_err(|e| (sink_side, e))?;
    Ok(total)
}

/// Local failures are transfer errors; a broken exec stream is a remote execution error
pub fn stream_failure(target: &ExecTarget, command: &str, side: StreamSide, error: std::io::Error) -> BackupError {
    match side {
        StreamSide::Local => BackupError::transfer(
            format!("streaming `{}` between this host and", command),
            target.to_string(),
            error,
        ),
        StreamSide::Remote => BackupError::RemoteExecution {
            target: target.to_string(),
            command: command.to_string(),
            reason: format!("stream interrupted: {}", error),
        },
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_scale(&self, namespace: &str, deployment: &str) -> Result<ReplicaCount>;

    async fn set_scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<ReplicaCount>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodSummary>>;

    /// Run `argv` in the target, pumping the given streams until the process exits
    async fn exec(&self, target: &ExecTarget, argv: &[String], streams: ExecStreams) -> Result<ExitStatus>;

    /// Open one forwarded connection to `port` inside the target pod
    async fn port_forward(&self, target: &ExecTarget, port: u16) -> Result<PortStream>;

    /// Secret data, or `None` when the secret does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    async fn patch_secret(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Log output of the target's container, optionally only the last `tail_lines` lines
    async fn pod_logs(&self, target: &ExecTarget, tail_lines: Option<i64>) -> Result<String>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using KUBECONFIG, ~/.kube/config or the in-cluster service account
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| BackupError::transport("connecting to the cluster, check your connectivity", e))?;
        Ok(Self { client })
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_scale(&self, namespace: &str, deployment: &str) -> Result<ReplicaCount> {
        let scale = self
            .deployments(namespace)
            .get_scale(deployment)
            .await
            .map_err(|e| {
                BackupError::transport(
                    format!("reading replicas of deployment {} in {}", deployment, namespace),
                    e,
                )
            })?;

        Ok(ReplicaCount::from_scale(scale, 0))
    }

    async fn set_scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<ReplicaCount> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let scale = self
            .deployments(namespace)
            .patch_scale(deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                BackupError::transport(
                    format!("scaling deployment {} in {} to {}", deployment, namespace, replicas),
                    e,
                )
            })?;

        Ok(ReplicaCount::from_scale(scale, replicas))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodSummary>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| {
                BackupError::transport(
                    format!("listing pods matching {} in {}", label_selector, namespace),
                    e,
                )
            })?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let status = pod.status.as_ref();
                PodSummary {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    phase: status.and_then(|s| s.phase.clone()),
                    pod_ip: status.and_then(|s| s.pod_ip.clone()),
                    terminating: pod.metadata.deletion_timestamp.is_some(),
                    containers: pod
                        .spec
                        .as_ref()
                        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn exec(&self, target: &ExecTarget, argv: &[String], streams: ExecStreams) -> Result<ExitStatus> {
        let command = argv.join(" ");
        let ExecStreams {
            stdin,
            mut stdout,
            mut stderr,
        } = streams;

        let mut params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = &target.container {
            params = params.container(container.clone());
        }

        debug!(target = %target, command = %command, "Opening exec session");
        let mut process = self
            .pods(&target.namespace)
            .exec(&target.pod_name, argv.to_vec(), &params)
            .await
            .map_err(|e| BackupError::transport(format!("opening exec session on {}", target), e))?;

        let status = process.take_status().ok_or_else(|| BackupError::RemoteExecution {
            target: target.to_string(),
            command: command.clone(),
            reason: "exec session did not negotiate a status channel".to_string(),
        })?;

        let remote_stdin = process.stdin();
        let remote_stdout = process.stdout();
        let remote_stderr = process.stderr();

        let pump_stdin = async move {
            if let (Some(mut source), Some(mut sink)) = (stdin, remote_stdin) {
                relay(&mut source, &mut sink, StreamSide::Local, StreamSide::Remote).await?;
                sink.shutdown().await.map_err(|e| (StreamSide::Remote, e))?;
            }
            Ok::<_, (StreamSide, std::io::Error)>(())
        };
        let pump_stdout = async {
            match remote_stdout {
                Some(mut source) => relay(&mut source, &mut stdout, StreamSide::Remote, StreamSide::Local)
                    .await
                    .map(|_| ()),
                None => stdout.flush().await.map_err(|e| (StreamSide::Local, e)),
            }
        };
        let pump_stderr = async {
            match remote_stderr {
                Some(mut source) => relay(&mut source, &mut stderr, StreamSide::Remote, StreamSide::Local)
                    .await
                    .map(|_| ()),
                None => stderr.flush().await.map_err(|e| (StreamSide::Local, e)),
            }
        };

        tokio::try_join!(pump_stdin, pump_stdout, pump_stderr)
            .map_err(|(side, e)| stream_failure(target, &command, side, e))?;

        let exit = exit_status_from(status.await);

        if let Err(e) = process.join().await {
            warn!(target = %target, error = %e, "Exec session did not shut down cleanly");
        }

        Ok(exit)
    }

    async fn port_forward(&self, target: &ExecTarget, port: u16) -> Result<PortStream> {
        let mut forwarder = self
            .pods(&target.namespace)
            .portforward(&target.pod_name, &[port])
            .await
            .map_err(|e| BackupError::transport(format!("opening port-forward to {}:{}", target, port), e))?;

        let stream = forwarder.take_stream(port).ok_or_else(|| {
            BackupError::transport(
                format!("opening port-forward to {}:{}", target, port),
                "port-forward session returned no stream",
            )
        })?;

        // The forwarder must outlive the stream; join it in the background
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(error = %e, "Port-forward session ended with error");
            }
        });

        Ok(Box::new(stream))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secret = self
            .secrets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| BackupError::transport(format!("reading secret {} in {}", name, namespace), e))?;

        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn patch_secret(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "stringData": { key: value } });
        self.secrets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| BackupError::transport(format!("updating secret {} in {}", name, namespace), e))?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| BackupError::transport(format!("deleting pod {} in {}", name, namespace), e))?;
        Ok(())
    }

    async fn pod_logs(&self, target: &ExecTarget, tail_lines: Option<i64>) -> Result<String> {
        let params = LogParams {
            container: target.container.clone(),
            tail_lines,
            ..LogParams::default()
        };
        self.pods(&target.namespace)
            .logs(&target.pod_name, &params)
            .await
            .map_err(|e| BackupError::transport(format!("reading logs of {}", target), e))
    }
}

/// Translate the exec status channel message into an exit code
///
/// The API server reports `Success`, or `Failure` with reason `NonZeroExitCode` and
/// an `ExitCode` cause. A missing status means the stream closed early.
pub fn exit_status_from(status: Option<Status>) -> ExitStatus {
    let Some(status) = status else {
        return ExitStatus::failed(-1, "exec stream closed before the command reported a status");
    };

    if status.status.as_deref() == Some("Success") {
        return ExitStatus::success();
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok())
        })
        .unwrap_or(-1);

    let message = status
        .message
        .or(status.reason)
        .unwrap_or_else(|| "remote command failed".to_string());

    ExitStatus::failed(code, message)
}
