mod cli;

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;

use cli::{BackupCommands, Cli, Commands, ConfigCommands, RestoreCommands, StorageArgs, TargetArgs};
use cnvrgctl::core::credentials::CredentialSource;
use cnvrgctl::core::resolver::TargetSelector;
use cnvrgctl::core::workflows::{DumpBackup, DumpRestore, FilesSync};
use cnvrgctl::core::{BackupEngine, KubeCluster, LogCollector, PostgresConnector, SdkStoreOpener};
use cnvrgctl::logging;
use cnvrgctl::utils::constants::*;
use cnvrgctl::utils::{format_bytes, format_elapsed, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config_path = cli.config.as_deref();
    let started = Instant::now();

    match cli.command {
        Commands::Backup { command } => {
            let (engine, namespace) = connect(config_path, cli.namespace.as_deref()).await?;
            handle_backup(&engine, command, &namespace).await?;
        }
        Commands::Restore { command } => {
            let (engine, namespace) = connect(config_path, cli.namespace.as_deref()).await?;
            handle_restore(&engine, command, &namespace).await?;
        }
        Commands::Logs { output, tail } => {
            let config = AppConfig::load(config_path)?;
            let namespace = config.namespace(cli.namespace.as_deref());
            handle_logs(&namespace, &output, tail).await?;
        }
        Commands::Config { command } => {
            return handle_config(&command, config_path);
        }
    }

    println!("Finished in {}", format_elapsed(started.elapsed()));
    Ok(())
}

/// Load config and connect to the cluster; the namespace flag beats the config file
async fn connect(config_path: Option<&Path>, namespace_flag: Option<&str>) -> Result<(BackupEngine, String)> {
    let config = AppConfig::load(config_path)?;
    let namespace = config.namespace(namespace_flag);
    let engine = build_engine(&config).await?;
    Ok((engine, namespace))
}

async fn build_engine(config: &AppConfig) -> Result<BackupEngine> {
    let settings = config.settings(std::env::var("PGPASSWORD").ok())?;
    let cluster = KubeCluster::connect()
        .await
        .context("Failed to connect to the Kubernetes cluster")?;
    let sql = PostgresConnector::new(
        settings.postgres.user.clone(),
        settings.postgres.admin_database.clone(),
        settings.postgres.password.clone(),
    );

    Ok(BackupEngine::new(Arc::new(cluster), Arc::new(sql), Arc::new(SdkStoreOpener), settings)
        .with_progress(std::io::stderr().is_terminal()))
}

fn selector(namespace: &str, args: &TargetArgs, default_deployment: &str) -> TargetSelector {
    let deployment = args.target.as_deref().unwrap_or(default_deployment);
    TargetSelector::new(namespace, deployment, args.label.clone()).with_container(args.container.clone())
}

fn files_sync(namespace: &str, storage: &StorageArgs, local_root: &Path) -> FilesSync {
    FilesSync {
        namespace: namespace.to_string(),
        credentials: CredentialSource::select(storage.flags(), namespace, &storage.secret_name),
        local_root: local_root.to_path_buf(),
    }
}

async fn handle_backup(engine: &BackupEngine, command: BackupCommands, namespace: &str) -> Result<()> {
    match command {
        BackupCommands::Postgres {
            target,
            file_name,
            disable_scale,
        } => {
            println!("Backing up postgres in namespace {}...", namespace.bold());
            let request = DumpBackup {
                target: selector(namespace, &target, POSTGRES_DEPLOYMENT),
                file_location: target.file_location.clone(),
                file_name,
                disable_scale,
            };
            let summary = engine
                .backup_postgres(&request)
                .await
                .context("Postgres backup failed")?;
            println!(
                "{} Postgres backup written to {} ({})",
                "✓".green(),
                summary.path.display(),
                format_bytes(summary.bytes)
            );
        }
        BackupCommands::Redis {
            target,
            file_name,
            secret_name,
            disable_scale,
        } => {
            println!("Backing up redis in namespace {}...", namespace.bold());
            let request = DumpBackup {
                target: selector(namespace, &target, REDIS_DEPLOYMENT),
                file_location: target.file_location.clone(),
                file_name,
                disable_scale,
            };
            let summary = engine
                .backup_redis(&request, &secret_name)
                .await
                .context("Redis backup failed")?;
            println!(
                "{} Redis backup written to {} ({})",
                "✓".green(),
                summary.path.display(),
                format_bytes(summary.bytes)
            );
        }
        BackupCommands::Files { storage, destination } => {
            println!("Downloading object storage into {}...", destination.display());
            let summary = engine
                .backup_files(&files_sync(namespace, &storage, &destination))
                .await
                .context("Object storage backup failed")?;
            println!(
                "{} Downloaded {} files ({}) from bucket {}",
                "✓".green(),
                summary.files,
                format_bytes(summary.bytes),
                summary.bucket
            );
        }
    }

    Ok(())
}

async fn handle_restore(engine: &BackupEngine, command: RestoreCommands, namespace: &str) -> Result<()> {
    match command {
        RestoreCommands::Postgres { target, file_name } => {
            println!(
                "{} Restoring postgres drops and recreates {} in namespace {}",
                "⚠".yellow(),
                engine.settings().postgres.database,
                namespace.bold()
            );
            let request = DumpRestore {
                target: selector(namespace, &target, POSTGRES_DEPLOYMENT),
                file_location: target.file_location.clone(),
                file_name,
            };
            let summary = engine
                .restore_postgres(&request)
                .await
                .context("Postgres restore failed")?;
            println!(
                "{} Restored {} into {}",
                "✓".green(),
                format_bytes(summary.bytes),
                summary.target
            );
        }
        RestoreCommands::Redis {
            target,
            file_name,
            secret_name,
        } => {
            println!("Restoring redis in namespace {}...", namespace.bold());
            let request = DumpRestore {
                target: selector(namespace, &target, REDIS_DEPLOYMENT),
                file_location: target.file_location.clone(),
                file_name,
            };
            let summary = engine
                .restore_redis(&request, &secret_name)
                .await
                .context("Redis restore failed")?;
            println!(
                "{} Restored {} into {}, pod restarted",
                "✓".green(),
                format_bytes(summary.bytes),
                summary.target
            );
        }
        RestoreCommands::Files { storage, source } => {
            if !source.is_dir() {
                return Err(anyhow!("Source directory {} does not exist", source.display()));
            }
            println!("Uploading {} into object storage...", source.display());
            let summary = engine
                .restore_files(&files_sync(namespace, &storage, &source))
                .await
                .context("Object storage restore failed")?;
            println!(
                "{} Uploaded {} files ({}) to bucket {}",
                "✓".green(),
                summary.files,
                format_bytes(summary.bytes),
                summary.bucket
            );
        }
    }

    Ok(())
}

async fn handle_logs(namespace: &str, output: &Path, tail: Option<i64>) -> Result<()> {
    let cluster = KubeCluster::connect()
        .await
        .context("Failed to connect to the Kubernetes cluster")?;
    println!("Collecting pod logs in namespace {}...", namespace.bold());
    let summary = LogCollector::new(Arc::new(cluster))
        .collect(namespace, output, tail)
        .await
        .context("Log collection failed")?;

    for pod in &summary.skipped {
        println!("{} Could not read logs of {}", "⚠".yellow(), pod);
    }
    println!(
        "{} Wrote logs of {} pods ({}) to {}",
        "✓".green(),
        summary.written.len(),
        format_bytes(summary.bytes),
        output.display()
    );
    Ok(())
}

fn handle_config(command: &ConfigCommands, path: Option<&Path>) -> Result<()> {
    match command {
        ConfigCommands::Init { force } => {
            let target = match path {
                Some(p) => p.to_path_buf(),
                None => AppConfig::config_path()?,
            };
            if target.exists() && !force {
                return Err(anyhow!(
                    "Config file {} already exists (use --force to overwrite)",
                    target.display()
                ));
            }
            let written = AppConfig::with_defaults().save(Some(&target))?;
            println!("{} Wrote {}", "✓".green(), written.display());
        }
        ConfigCommands::Show => {
            let config = AppConfig::load(path)?;
            let settings = config.settings(None)?;
            println!("namespace = {}", config.namespace(None));
            println!("workloads = {}", settings.workloads.join(", "));
            println!("scale_timeout = {}", humantime::format_duration(settings.scale_timeout));
            println!("poll_interval = {}", humantime::format_duration(settings.poll_interval));
            println!(
                "tunnel_ready_timeout = {}",
                humantime::format_duration(settings.tunnel_ready_timeout)
            );
            println!(
                "postgres = {}@127.0.0.1/{} (restores {}, port {})",
                settings.postgres.user,
                settings.postgres.admin_database,
                settings.postgres.database,
                settings.postgres.port
            );
            println!("redis.port = {}", settings.redis_port);
        }
    }

    Ok(())
}
