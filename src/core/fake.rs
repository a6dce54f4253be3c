/// In-memory cluster used by unit tests
///
/// Simulates deployments, pods, secrets and a single remote filesystem shared by
/// all pods. Exec understands the command vocabulary in `core::exec` plus the
/// dump, restore and redis scripts issued by the workflows.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::core::cluster::{
    relay, stream_failure, ClusterApi, ExecStreams, ExecTarget, ExitStatus, PodSummary, PortStream,
    ReplicaCount, StreamSide,
};
use crate::core::database::{SqlConnector, SqlSession};
use crate::core::error::{BackupError, Result};
use crate::core::exec::WRITE_STREAM_SCRIPT;
use crate::core::storage::{ObjectEntry, ObjectStoreClient, ObjectStoreTarget, StoreOpener};

#[derive(Default)]
struct State {
    deployments: BTreeMap<String, ReplicaCount>,
    pods: Vec<(String, PodSummary)>,
    logs: BTreeMap<(String, Option<String>), String>,
    files: BTreeMap<String, Vec<u8>>,
    secrets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    events: Vec<String>,
    stdin_seen: Vec<String>,
    failing_scripts: Vec<(String, i32, String)>,
    fail_port_forward: bool,
    stall_port_forward: bool,
}

pub struct FakeCluster {
    namespace: String,
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_deployment(&self, name: &str, replicas: i32) {
        self.with_state(|s| {
            s.deployments.insert(
                name.to_string(),
                ReplicaCount {
                    desired: replicas,
                    current: replicas,
                    selector: Some(format!("app={}", name)),
                },
            )
        });
    }

    /// Add a running pod reachable through `label_selector`
    pub fn add_pod(&self, label_selector: &str, name: &str) {
        self.with_state(|s| {
            s.pods.push((
                label_selector.to_string(),
                PodSummary {
                    name: name.to_string(),
                    phase: Some("Running".to_string()),
                    pod_ip: Some("10.42.0.12".to_string()),
                    terminating: false,
                    containers: Vec::new(),
                },
            ))
        });
    }

    /// Add a pod that has a deletion timestamp but has not gone away yet
    pub fn add_terminating_pod(&self, label_selector: &str, name: &str) {
        self.with_state(|s| {
            s.pods.push((
                label_selector.to_string(),
                PodSummary {
                    name: name.to_string(),
                    phase: Some("Running".to_string()),
                    pod_ip: Some("10.42.0.13".to_string()),
                    terminating: true,
                    containers: Vec::new(),
                },
            ))
        });
    }

    /// Add a running pod with named containers
    pub fn add_pod_with_containers(&self, label_selector: &str, name: &str, containers: &[&str]) {
        self.add_pod(label_selector, name);
        self.with_state(|s| {
            if let Some((_, pod)) = s.pods.iter_mut().rev().find(|(_, p)| p.name == name) {
                pod.containers = containers.iter().map(|c| c.to_string()).collect();
            }
        });
    }

    /// Log text served for `pod` (and `container`, when the pod has several)
    pub fn add_pod_log(&self, pod: &str, container: Option<&str>, text: &str) {
        self.with_state(|s| {
            s.logs.insert(
                (pod.to_string(), container.map(|c| c.to_string())),
                text.to_string(),
            )
        });
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.with_state(|s| s.files.insert(path.to_string(), content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.files.get(path).cloned())
    }

    pub fn add_secret(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.with_state(|s| s.secrets.insert(name.to_string(), data));
    }

    pub fn secret_value(&self, name: &str, key: &str) -> Option<String> {
        self.with_state(|s| {
            s.secrets
                .get(name)
                .and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(v).to_string())
        })
    }

    /// Make any shell script containing `needle` exit with `code`
    pub fn fail_script(&self, needle: &str, code: i32, stderr: &str) {
        self.with_state(|s| {
            s.failing_scripts
                .push((needle.to_string(), code, stderr.to_string()))
        });
    }

    pub fn fail_port_forward(&self) {
        self.with_state(|s| s.fail_port_forward = true);
    }

    /// Port-forward negotiation never completes
    pub fn stall_port_forward(&self) {
        self.with_state(|s| s.stall_port_forward = true);
    }

    /// Everything the cluster was asked to do, in order
    pub fn events(&self) -> Vec<String> {
        self.with_state(|s| s.events.clone())
    }

    pub fn stdin_seen(&self) -> Vec<String> {
        self.with_state(|s| s.stdin_seen.clone())
    }

    fn record(&self, event: String) {
        self.with_state(|s| s.events.push(event));
    }

    fn check_namespace(&self, namespace: &str, what: &str) -> Result<()> {
        if namespace == self.namespace {
            Ok(())
        } else {
            Err(BackupError::transport(
                format!("{} in {}", what, namespace),
                format!("namespaces \"{}\" not found", namespace),
            ))
        }
    }

    async fn run_script(&self, script: &str, stdin: Option<String>) -> (ExitStatus, Vec<u8>) {
        let failure = self.with_state(|s| {
            s.failing_scripts
                .iter()
                .find(|(needle, _, _)| script.contains(needle.as_str()))
                .cloned()
        });
        if let Some((_, code, stderr)) = failure {
            return (ExitStatus::failed(code, "command terminated with non-zero exit code"), stderr.into_bytes());
        }

        let last_token = script.split_whitespace().last().unwrap_or_default().to_string();

        if script.contains("pg_dump") {
            self.add_file(&last_token, b"PGDMP\x01\x0e\x00fake custom-format dump");
        } else if script.contains("pg_restore") {
            match self.file(&last_token) {
                Some(content) if !content.is_empty() => {}
                _ => {
                    return (
                        ExitStatus::failed(1, "command terminated with non-zero exit code"),
                        b"pg_restore: error: input file is too short (read 0, expected 5)".to_vec(),
                    )
                }
            }
        } else if script.contains("redis-cli") {
            if let Some(line) = stdin {
                self.with_state(|s| s.stdin_seen.push(line.trim_end().to_string()));
            }
            self.add_file("/data/dump.rdb", b"REDIS0011fake");
        } else if script.contains("appendonly.aof") {
            self.with_state(|s| {
                if let Some(aof) = s.files.remove("/data/appendonly.aof") {
                    s.files.insert("/data/appendonly.aof.old".to_string(), aof);
                }
            });
        }

        (ExitStatus::success(), Vec::new())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_scale(&self, namespace: &str, deployment: &str) -> Result<ReplicaCount> {
        self.check_namespace(namespace, "reading scale")?;
        self.with_state(|s| s.deployments.get(deployment).cloned())
            .ok_or_else(|| {
                BackupError::transport(
                    format!("reading replicas of deployment {}", deployment),
                    format!("deployments.apps \"{}\" not found", deployment),
                )
            })
    }

    async fn set_scale(&self, namespace: &str, deployment: &str, replicas: i32) -> Result<ReplicaCount> {
        self.check_namespace(namespace, "scaling")?;
        let updated = self.with_state(|s| {
            s.deployments.get_mut(deployment).map(|count| {
                count.desired = replicas;
                count.current = replicas;
                count.clone()
            })
        });
        let updated = updated.ok_or_else(|| {
            BackupError::transport(
                format!("scaling deployment {}", deployment),
                format!("deployments.apps \"{}\" not found", deployment),
            )
        })?;
        self.record(format!("scale {}={}", deployment, replicas));
        Ok(updated)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodSummary>> {
        if namespace != self.namespace {
            return Ok(Vec::new());
        }
        Ok(self.with_state(|s| {
            s.pods
                .iter()
                .filter(|(selector, _)| label_selector.is_empty() || selector == label_selector)
                .map(|(_, pod)| pod.clone())
                .collect()
        }))
    }

    async fn exec(&self, target: &ExecTarget, argv: &[String], streams: ExecStreams) -> Result<ExitStatus> {
        self.check_namespace(&target.namespace, "exec")?;
        let ExecStreams {
            stdin,
            mut stdout,
            mut stderr,
        } = streams;

        let (exit, out, err) = match argv {
            [cat, path] if cat == "cat" => {
                self.record(format!("exec cat {}", path));
                match self.file(path) {
                    Some(content) => (ExitStatus::success(), content, Vec::new()),
                    None => (
                        ExitStatus::failed(1, "command terminated with non-zero exit code"),
                        Vec::new(),
                        format!("cat: {}: No such file or directory", path).into_bytes(),
                    ),
                }
            }
            [sh, c, script, _, len, path] if sh == "sh" && c == "-c" && script == WRITE_STREAM_SCRIPT => {
                self.record(format!("exec write {}", path));
                let len: u64 = len.parse().unwrap();
                let mut content = Vec::new();
                if let Some(source) = stdin {
                    source.take(len).read_to_end(&mut content).await.unwrap();
                }
                self.add_file(path, &content);
                (ExitStatus::success(), Vec::new(), Vec::new())
            }
            [sh, c, script] if sh == "sh" && c == "-c" => {
                self.record(format!("exec sh {}", script));
                let mut input = None;
                if let Some(mut source) = stdin {
                    let mut buf = String::new();
                    source.read_to_string(&mut buf).await.unwrap();
                    input = Some(buf);
                }
                let (exit, err) = self.run_script(script, input).await;
                (exit, Vec::new(), err)
            }
            other => panic!("unexpected command {:?}", other),
        };

        let command = argv.join(" ");
        relay(&mut out.as_slice(), &mut stdout, StreamSide::Remote, StreamSide::Local)
            .await
            .map_err(|(side, e)| stream_failure(target, &command, side, e))?;
        relay(&mut err.as_slice(), &mut stderr, StreamSide::Remote, StreamSide::Local)
            .await
            .map_err(|(side, e)| stream_failure(target, &command, side, e))?;
        Ok(exit)
    }

    async fn port_forward(&self, target: &ExecTarget, port: u16) -> Result<PortStream> {
        self.check_namespace(&target.namespace, "port-forward")?;
        if self.with_state(|s| s.fail_port_forward) {
            return Err(BackupError::transport(
                format!("opening port-forward to {}:{}", target, port),
                "unable to upgrade connection: pod not ready",
            ));
        }
        if self.with_state(|s| s.stall_port_forward) {
            futures::future::pending::<()>().await;
        }
        self.record(format!("port-forward {}:{}", target.pod_name, port));

        // Echo server standing in for the remote port
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(local))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        self.check_namespace(namespace, "reading secret")?;
        Ok(self.with_state(|s| s.secrets.get(name).cloned()))
    }

    async fn patch_secret(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        self.check_namespace(namespace, "updating secret")?;
        self.with_state(|s| {
            s.secrets
                .entry(name.to_string())
                .or_default()
                .insert(key.to_string(), value.as_bytes().to_vec())
        });
        self.record(format!("patch-secret {}/{}", name, key));
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_namespace(namespace, "deleting pod")?;
        self.with_state(|s| s.pods.retain(|(_, pod)| pod.name != name));
        self.record(format!("delete-pod {}", name));
        Ok(())
    }

    async fn pod_logs(&self, target: &ExecTarget, tail_lines: Option<i64>) -> Result<String> {
        self.check_namespace(&target.namespace, "reading logs")?;
        let key = (target.pod_name.clone(), target.container.clone());
        let text = self.with_state(|s| s.logs.get(&key).cloned()).ok_or_else(|| {
            BackupError::transport(
                format!("reading logs of {}", target),
                format!("container not found in pod \"{}\"", target.pod_name),
            )
        })?;
        Ok(match tail_lines {
            Some(n) => {
                let lines: Vec<&str> = text.lines().collect();
                let start = lines.len().saturating_sub(n.max(0) as usize);
                lines[start..].iter().map(|l| format!("{}\n", l)).collect()
            }
            None => text,
        })
    }
}

#[derive(Default)]
struct SqlState {
    databases: BTreeSet<String>,
    executed: Vec<String>,
    fail_on: Option<String>,
    ports: Vec<u16>,
}

/// Recording SQL backend with a set of existing databases
#[derive(Clone, Default)]
pub struct FakeSql {
    inner: Arc<Mutex<SqlState>>,
}

impl FakeSql {
    pub fn with_database(name: &str) -> Self {
        let sql = Self::default();
        sql.inner.lock().unwrap().databases.insert(name.to_string());
        sql
    }

    pub fn session(&self) -> FakeSqlSession {
        FakeSqlSession {
            inner: self.inner.clone(),
        }
    }

    /// Fail the first statement containing `needle`
    pub fn fail_on(&self, needle: &str) {
        self.inner.lock().unwrap().fail_on = Some(needle.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().databases.contains(name)
    }

    pub fn connected_ports(&self) -> Vec<u16> {
        self.inner.lock().unwrap().ports.clone()
    }
}

fn database_name(statement: &str, prefix: &str) -> Option<String> {
    statement
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches("IF EXISTS ").trim().trim_matches('"').to_string())
}

pub struct FakeSqlSession {
    inner: Arc<Mutex<SqlState>>,
}

#[async_trait]
impl SqlSession for FakeSqlSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(needle) = &state.fail_on {
            if statement.contains(needle.as_str()) {
                return Err(BackupError::sql(statement, "ERROR: permission denied"));
            }
        }
        if let Some(name) = database_name(statement, "DROP DATABASE ") {
            state.databases.remove(&name);
        } else if let Some(name) = database_name(statement, "CREATE DATABASE ") {
            state.databases.insert(name);
        }
        state.executed.push(statement.to_string());
        Ok(())
    }

    async fn database_exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().databases.contains(name))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SqlConnector for FakeSql {
    async fn connect(&self, local_port: u16) -> Result<Box<dyn SqlSession>> {
        self.inner.lock().unwrap().ports.push(local_port);
        Ok(Box::new(self.session()))
    }
}

#[derive(Default)]
struct BucketState {
    objects: BTreeMap<String, Vec<u8>>,
    failing_gets: BTreeSet<String>,
    failing_puts: BTreeSet<String>,
}

/// In-memory bucket
#[derive(Clone)]
pub struct MemoryStore {
    bucket: String,
    inner: Arc<Mutex<BucketState>>,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            inner: Arc::new(Mutex::new(BucketState::default())),
        }
    }

    pub fn insert(&self, key: &str, content: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), content.to_vec());
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn fail_get(&self, key: &str) {
        self.inner.lock().unwrap().failing_gets.insert(key.to_string());
    }

    pub fn fail_put(&self, key: &str) {
        self.inner.lock().unwrap().failing_puts.insert(key.to_string());
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .objects
            .iter()
            .map(|(key, content)| ObjectEntry {
                key: key.clone(),
                size: content.len() as u64,
            })
            .collect())
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<u64> {
        let content = {
            let state = self.inner.lock().unwrap();
            if state.failing_gets.contains(key) {
                return Err(BackupError::transport(
                    format!("downloading s3://{}/{}", self.bucket, key),
                    "connection reset by peer",
                ));
            }
            state.objects.get(key).cloned()
        };
        let content = content.ok_or_else(|| {
            BackupError::transport(format!("downloading s3://{}/{}", self.bucket, key), "NoSuchKey")
        })?;
        tokio::fs::write(destination, &content)
            .await
            .map_err(|e| BackupError::transfer("writing", destination, e))?;
        Ok(content.len() as u64)
    }

    async fn put(&self, key: &str, source: &Path) -> Result<u64> {
        if self.inner.lock().unwrap().failing_puts.contains(key) {
            return Err(BackupError::transport(
                format!("uploading to s3://{}/{}", self.bucket, key),
                "AccessDenied",
            ));
        }
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| BackupError::transfer("reading", source, e))?;
        let len = content.len() as u64;
        self.inner.lock().unwrap().objects.insert(key.to_string(), content);
        Ok(len)
    }
}

/// Hands out one shared `MemoryStore` and remembers the targets it was asked for
#[derive(Clone)]
pub struct MemoryStoreOpener {
    pub store: MemoryStore,
    opened: Arc<Mutex<Vec<ObjectStoreTarget>>>,
}

impl MemoryStoreOpener {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn opened(&self) -> Vec<ObjectStoreTarget> {
        self.opened.lock().unwrap().clone()
    }
}

impl StoreOpener for MemoryStoreOpener {
    fn open(&self, target: &ObjectStoreTarget) -> Arc<dyn ObjectStoreClient> {
        self.opened.lock().unwrap().push(target.clone());
        Arc::new(self.store.clone())
    }
}
