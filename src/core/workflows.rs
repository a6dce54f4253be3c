/// Backup and restore workflows
///
/// Composes scaling, target resolution, remote commands, artifact transfer, tunnels,
/// database reset and bucket sync into the six cnvrgctl workflows. Each step runs only
/// if the previous one succeeded. Backups scale the application back up only after a
/// successful transfer; restores always scale it back up.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::{error, info, warn};

use crate::core::cluster::{ClusterApi, ExecTarget};
use crate::core::credentials::{read_secret_value, CredentialSource};
use crate::core::database::{DatabaseReset, SqlConnector};
use crate::core::error::{BackupError, Result};
use crate::core::exec::{CommandChannel, RemoteCommand};
use crate::core::resolver::{ResolvedTarget, TargetResolver, TargetSelector};
use crate::core::scaler::{ScaleTarget, WorkloadScaler};
use crate::core::storage::StoreOpener;
use crate::core::sync::ObjectSync;
use crate::core::transfer::{self, BackupArtifact};
use crate::core::tunnel::Tunnel;
use crate::utils::constants::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub user: String,
    pub database: String,
    pub admin_database: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Engine-wide settings resolved from config and defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub workloads: Vec<String>,
    pub scale_timeout: Duration,
    pub poll_interval: Duration,
    pub tunnel_ready_timeout: Duration,
    pub postgres: PostgresSettings,
    pub redis_port: u16,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workloads: default_workloads(),
            scale_timeout: DEFAULT_SCALE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tunnel_ready_timeout: DEFAULT_TUNNEL_READY_TIMEOUT,
            postgres: PostgresSettings {
                user: POSTGRES_USER.to_string(),
                database: POSTGRES_DATABASE.to_string(),
                admin_database: POSTGRES_ADMIN_DATABASE.to_string(),
                port: POSTGRES_PORT,
                password: None,
            },
            redis_port: REDIS_PORT,
        }
    }
}

/// Backup of a database or cache into a local file
#[derive(Debug, Clone)]
pub struct DumpBackup {
    pub target: TargetSelector,
    pub file_location: PathBuf,
    pub file_name: String,
    pub disable_scale: bool,
}

/// Restore of a database or cache from a local file
#[derive(Debug, Clone)]
pub struct DumpRestore {
    pub target: TargetSelector,
    pub file_location: PathBuf,
    pub file_name: String,
}

/// Bucket sync in either direction
#[derive(Debug, Clone)]
pub struct FilesSync {
    pub namespace: String,
    pub credentials: CredentialSource,
    pub local_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub target: ExecTarget,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub target: ExecTarget,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub bucket: String,
    pub files: usize,
    pub bytes: u64,
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Dump script run inside the postgres pod; the password comes from the pod env
pub fn postgres_dump_script(settings: &PostgresSettings, remote_path: &str) -> String {
    format!(
        "export PGPASSWORD=\"$POSTGRESQL_PASSWORD\"; pg_dump -h localhost -p {} -U {} -d {} -Fc > {}",
        settings.port,
        sh_quote(&settings.user),
        sh_quote(&settings.database),
        remote_path
    )
}

pub fn postgres_restore_script(settings: &PostgresSettings, remote_path: &str) -> String {
    format!(
        "export PGPASSWORD=\"$POSTGRESQL_PASSWORD\"; pg_restore -h localhost -p {} -U {} -d {} -j {} --verbose {}",
        settings.port,
        sh_quote(&settings.user),
        sh_quote(&settings.database),
        POSTGRES_RESTORE_JOBS,
        remote_path
    )
}

/// `redis-cli save` with the password read from stdin into REDISCLI_AUTH
pub fn redis_save_script(port: u16) -> String {
    format!(
        "read -r REDISCLI_AUTH; export REDISCLI_AUTH; redis-cli -p {} save",
        port
    )
}

pub fn redis_aof_aside_script() -> String {
    format!(
        "if [ -f {aof} ]; then mv {aof} {aof}.old; fi",
        aof = REDIS_APPENDONLY_FILE
    )
}

/// Turn `appendonly yes` into `appendonly no`, leaving every other line untouched
pub fn disable_appendonly(conf: &str) -> String {
    static APPENDONLY_RE: OnceLock<Regex> = OnceLock::new();
    let re = APPENDONLY_RE.get_or_init(|| Regex::new(r"(?mi)^(\s*appendonly\s+)yes\b").unwrap());
    re.replace_all(conf, "${1}no").to_string()
}

/// Keep the workflow error; a failed scale-up is logged when both failed
fn with_scale_up<T>(result: Result<T>, scaled_up: Result<()>) -> Result<T> {
    match (result, scaled_up) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(scale_err)) => {
            error!(error = %scale_err, "Scale-up after failed restore also failed");
            Err(e)
        }
    }
}

pub struct BackupEngine {
    cluster: Arc<dyn ClusterApi>,
    scaler: WorkloadScaler,
    resolver: TargetResolver,
    reset: DatabaseReset,
    stores: Arc<dyn StoreOpener>,
    settings: EngineSettings,
    show_progress: bool,
}

impl BackupEngine {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        sql: Arc<dyn SqlConnector>,
        stores: Arc<dyn StoreOpener>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            scaler: WorkloadScaler::new(cluster.clone(), settings.scale_timeout, settings.poll_interval),
            resolver: TargetResolver::new(cluster.clone()),
            reset: DatabaseReset::new(sql),
            cluster,
            stores,
            settings,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn scale_down(&self, namespace: &str) -> Result<()> {
        let target = ScaleTarget::new(namespace, &self.settings.workloads, SCALE_DOWN_REPLICAS);
        info!(namespace = %namespace, "Scaling application down");
        self.scaler.scale_and_wait(&target).await?;
        Ok(())
    }

    async fn scale_up(&self, namespace: &str) -> Result<()> {
        let target = ScaleTarget::new(namespace, &self.settings.workloads, SCALE_UP_REPLICAS);
        info!(namespace = %namespace, "Scaling application up");
        self.scaler.scale_to(&target).await?;
        Ok(())
    }

    async fn resolve(&self, selector: &TargetSelector) -> Result<ResolvedTarget> {
        let resolved = self.resolver.resolve(selector).await?;
        info!(
            target = %resolved.target,
            ip = resolved.pod_ip.as_deref().unwrap_or("unknown"),
            "Resolved target pod"
        );
        Ok(resolved)
    }

    fn channel(&self, resolved: &ResolvedTarget) -> CommandChannel {
        CommandChannel::new(self.cluster.clone(), resolved.target.clone())
    }

    /// Scale back up after a successful capture; a failed capture leaves workloads down
    async fn finish_backup(&self, request: &DumpBackup, captured: Result<BackupSummary>) -> Result<BackupSummary> {
        if request.disable_scale {
            return captured;
        }
        let namespace = &request.target.namespace;
        match captured {
            Ok(summary) => {
                self.scale_up(namespace).await?;
                Ok(summary)
            }
            Err(e) => {
                warn!(namespace = %namespace, "Backup failed, workloads stay scaled down");
                Err(e)
            }
        }
    }

    async fn pull_artifact(&self, channel: &CommandChannel, artifact: &BackupArtifact) -> Result<BackupSummary> {
        let bytes = transfer::pull(
            channel,
            &artifact.remote_path,
            &artifact.local_directory,
            &artifact.file_name,
        )
        .await?;
        if bytes == 0 {
            return Err(BackupError::transfer(
                "backup produced an empty file at",
                artifact.local_path(),
                format!("{} was empty on {}", artifact.remote_path, channel.target()),
            ));
        }
        Ok(BackupSummary {
            target: channel.target().clone(),
            path: artifact.local_path(),
            bytes,
        })
    }

    /// Scale down, dump postgres inside its pod, pull the dump, scale up
    pub async fn backup_postgres(&self, request: &DumpBackup) -> Result<BackupSummary> {
        if !request.disable_scale {
            self.scale_down(&request.target.namespace).await?;
        }
        let captured = self.capture_postgres(request).await;
        self.finish_backup(request, captured).await
    }

    async fn capture_postgres(&self, request: &DumpBackup) -> Result<BackupSummary> {
        let resolved = self.resolve(&request.target).await?;
        let channel = self.channel(&resolved);

        let script = postgres_dump_script(&self.settings.postgres, POSTGRES_REMOTE_DUMP);
        channel.run(&RemoteCommand::shell(script), None).await?;
        info!(target = %channel.target(), "Postgres dump captured");

        let artifact = BackupArtifact::new(
            request.file_name.clone(),
            request.file_location.clone(),
            POSTGRES_REMOTE_DUMP,
        );
        self.pull_artifact(&channel, &artifact).await
    }

    /// Scale down, `redis-cli save` inside the redis pod, pull dump.rdb, scale up
    ///
    /// The password is read from `secret_name` before anything is scaled.
    pub async fn backup_redis(&self, request: &DumpBackup, secret_name: &str) -> Result<BackupSummary> {
        let password = read_secret_value(
            self.cluster.as_ref(),
            &request.target.namespace,
            secret_name,
            REDIS_PASSWORD_KEY,
        )
        .await?;

        if !request.disable_scale {
            self.scale_down(&request.target.namespace).await?;
        }
        let captured = self.capture_redis(request, &password).await;
        self.finish_backup(request, captured).await
    }

    async fn capture_redis(&self, request: &DumpBackup, password: &str) -> Result<BackupSummary> {
        let resolved = self.resolve(&request.target).await?;
        let channel = self.channel(&resolved);

        let stdin = std::io::Cursor::new(format!("{}\n", password).into_bytes());
        channel
            .run(
                &RemoteCommand::shell(redis_save_script(self.settings.redis_port)),
                Some(Box::new(stdin)),
            )
            .await?;
        info!(target = %channel.target(), "Redis snapshot saved");

        let artifact = BackupArtifact::new(
            request.file_name.clone(),
            request.file_location.clone(),
            REDIS_REMOTE_DUMP,
        );
        self.pull_artifact(&channel, &artifact).await
    }

    /// Resolve credentials, scale down, download the bucket, scale up iff it synced
    pub async fn backup_files(&self, request: &FilesSync) -> Result<SyncSummary> {
        let target = request.credentials.resolve(self.cluster.as_ref()).await?;
        let store = self.stores.open(&target);

        self.scale_down(&request.namespace).await?;

        let outcome = ObjectSync::new(store)
            .with_progress(self.show_progress)
            .sync_down(&request.local_root)
            .await;

        let outcome = match outcome.into_result() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(namespace = %request.namespace, "Bucket download failed, workloads stay scaled down");
                return Err(e);
            }
        };

        self.scale_up(&request.namespace).await?;
        Ok(SyncSummary {
            bucket: target.bucket,
            files: outcome.transferred,
            bytes: outcome.bytes,
        })
    }

    /// Resolve credentials and upload the local tree; no scaling
    pub async fn restore_files(&self, request: &FilesSync) -> Result<SyncSummary> {
        let target = request.credentials.resolve(self.cluster.as_ref()).await?;
        let store = self.stores.open(&target);

        let outcome = ObjectSync::new(store)
            .with_progress(self.show_progress)
            .sync_up(&request.local_root)
            .await
            .into_result()?;

        Ok(SyncSummary {
            bucket: target.bucket,
            files: outcome.transferred,
            bytes: outcome.bytes,
        })
    }

    /// Resolve, scale down, push the dump, recreate the database, pg_restore, scale up
    ///
    /// Scale-up runs whatever happens after resolution.
    pub async fn restore_postgres(&self, request: &DumpRestore) -> Result<RestoreSummary> {
        let resolved = self.resolve(&request.target).await?;
        let namespace = request.target.namespace.clone();

        let result = self.restore_postgres_steps(&resolved, request).await;
        let scaled_up = self.scale_up(&namespace).await;
        with_scale_up(result, scaled_up)
    }

    async fn restore_postgres_steps(&self, resolved: &ResolvedTarget, request: &DumpRestore) -> Result<RestoreSummary> {
        let settings = &self.settings.postgres;
        self.scale_down(&request.target.namespace).await?;

        let channel = self.channel(resolved);
        let local_file = request.file_location.join(&request.file_name);
        let bytes = transfer::push(&channel, &local_file, POSTGRES_REMOTE_DUMP).await?;

        let mut tunnel = Tunnel::open(self.cluster.clone(), resolved.target.clone(), settings.port).await?;
        let reset = async {
            tunnel.wait_ready(self.settings.tunnel_ready_timeout).await?;
            info!(
                pod_ip = resolved.pod_ip.as_deref().unwrap_or("unknown"),
                local_port = tunnel.local_port(),
                "Resetting database through tunnel"
            );
            self.reset.quiesce_and_recreate(&tunnel, &settings.database).await
        }
        .await;
        tunnel.close().await;
        reset?;

        let script = postgres_restore_script(settings, POSTGRES_REMOTE_DUMP);
        channel.run(&RemoteCommand::shell(script), None).await?;
        info!(target = %channel.target(), database = %settings.database, "Postgres restore finished");

        Ok(RestoreSummary {
            target: resolved.target.clone(),
            bytes,
        })
    }

    /// Resolve, scale down, push dump.rdb, disable AOF, restart redis, scale up
    ///
    /// `secret_name` holds redis.conf. Scale-up runs whatever happens after resolution.
    pub async fn restore_redis(&self, request: &DumpRestore, secret_name: &str) -> Result<RestoreSummary> {
        let resolved = self.resolve(&request.target).await?;
        let namespace = request.target.namespace.clone();

        let result = self.restore_redis_steps(&resolved, request, secret_name).await;
        let scaled_up = self.scale_up(&namespace).await;
        with_scale_up(result, scaled_up)
    }

    async fn restore_redis_steps(
        &self,
        resolved: &ResolvedTarget,
        request: &DumpRestore,
        secret_name: &str,
    ) -> Result<RestoreSummary> {
        let namespace = &request.target.namespace;
        self.scale_down(namespace).await?;

        let channel = self.channel(resolved);
        let local_file = request.file_location.join(&request.file_name);
        let bytes = transfer::push(&channel, &local_file, REDIS_REMOTE_DUMP).await?;

        channel
            .run(&RemoteCommand::shell(redis_aof_aside_script()), None)
            .await?;

        let conf = read_secret_value(self.cluster.as_ref(), namespace, secret_name, REDIS_CONF_KEY).await?;
        let updated = disable_appendonly(&conf);
        self.cluster
            .patch_secret(namespace, secret_name, REDIS_CONF_KEY, &updated)
            .await?;
        info!(secret = %secret_name, "Disabled appendonly in redis.conf");

        // The controller recreates the pod, which loads dump.rdb on start
        self.cluster.delete_pod(namespace, &resolved.target.pod_name).await?;
        info!(pod = %resolved.target.pod_name, "Restarted redis pod");

        Ok(RestoreSummary {
            target: resolved.target.clone(),
            bytes,
        })
    }
}
