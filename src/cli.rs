/// CLI argument parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cnvrgctl::core::credentials::StorageFlags;
use cnvrgctl::core::storage::BackendKind;
use cnvrgctl::utils::constants::*;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "cnvrgctl")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Kubernetes namespace of the cnvrg installation
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Config file (defaults to ~/.config/cnvrgctl/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up postgres, redis or object storage
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Restore postgres, redis or object storage
    Restore {
        #[command(subcommand)]
        command: RestoreCommands,
    },

    /// Save the logs of every pod in the namespace to <output>/<pod>.txt
    Logs {
        /// Directory to write the log files into
        #[arg(short, long, default_value = DEFAULT_LOGS_DIR)]
        output: PathBuf,

        /// Only keep the last N lines of each container
        #[arg(long)]
        tail: Option<i64>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Dump the cnvrg database to a local file
    Postgres {
        #[command(flatten)]
        target: TargetArgs,

        /// Local file name of the dump
        #[arg(long, default_value = POSTGRES_BACKUP_FILE)]
        file_name: String,

        /// Leave the application running during the dump
        #[arg(long)]
        disable_scale: bool,
    },

    /// Save redis and copy dump.rdb to a local file
    Redis {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, default_value = REDIS_BACKUP_FILE)]
        file_name: String,

        /// Secret holding the redis password
        #[arg(long, default_value = REDIS_SECRET)]
        secret_name: String,

        /// Leave the application running during the save
        #[arg(long)]
        disable_scale: bool,
    },

    /// Download the object storage bucket into a local directory
    Files {
        #[command(flatten)]
        storage: StorageArgs,

        /// Local directory to download into
        #[arg(long, default_value = STORAGE_ROOT)]
        destination: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum RestoreCommands {
    /// Recreate the cnvrg database from a local dump
    Postgres {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, default_value = POSTGRES_BACKUP_FILE)]
        file_name: String,
    },

    /// Replace the redis dataset with a local dump.rdb
    Redis {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, default_value = REDIS_BACKUP_FILE)]
        file_name: String,

        /// Secret holding redis.conf
        #[arg(long, default_value = REDIS_SECRET)]
        secret_name: String,
    },

    /// Upload a local directory into the object storage bucket
    Files {
        #[command(flatten)]
        storage: StorageArgs,

        /// Local directory to upload from
        #[arg(long, default_value = STORAGE_ROOT)]
        source: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a config file with every default filled in
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

/// Which pod to exec into and where the local dump lives
#[derive(Args, Clone)]
pub struct TargetArgs {
    /// Deployment name, matched against the label value (postgres or redis by default)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Label key used to select the pod
    #[arg(short, long, default_value = DEFAULT_LABEL_KEY)]
    pub label: String,

    /// Container inside the pod
    #[arg(long)]
    pub container: Option<String>,

    /// Local directory for the dump file
    #[arg(short, long, default_value = DEFAULT_FILE_LOCATION)]
    pub file_location: PathBuf,
}

/// Object storage credentials; the cluster secret is used when none are given
#[derive(Args, Clone)]
pub struct StorageArgs {
    /// Secret holding the object storage credentials
    #[arg(long, default_value = STORAGE_SECRET)]
    pub secret_name: String,

    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub access_key: Option<String>,

    #[arg(long)]
    pub secret_key: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub session_token: Option<String>,

    /// aws or minio
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<BackendKind>,
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    value.parse().map_err(|e: cnvrgctl::core::BackupError| e.to_string())
}

impl StorageArgs {
    pub fn flags(&self) -> StorageFlags {
        StorageFlags {
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            session_token: self.session_token.clone(),
            backend: self.backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_postgres_defaults() {
        let cli = Cli::parse_from(["cnvrgctl", "backup", "postgres", "-n", "demo"]);
        assert_eq!(cli.namespace.as_deref(), Some("demo"));
        match cli.command {
            Commands::Backup {
                command: BackupCommands::Postgres {
                    target,
                    file_name,
                    disable_scale,
                },
            } => {
                assert_eq!(target.target, None);
                assert_eq!(target.label, "app");
                assert_eq!(target.file_location, PathBuf::from("."));
                assert_eq!(file_name, "cnvrg-db-backup.sql");
                assert!(!disable_scale);
            }
            _ => panic!("expected backup postgres"),
        }
    }

    #[test]
    fn test_restore_files_explicit_flags() {
        let cli = Cli::parse_from([
            "cnvrgctl", "restore", "files", "--endpoint", "minio:9000", "--access-key", "ak",
            "--secret-key", "sk", "--bucket", "b", "--backend", "minio", "--source", "/tmp/s",
        ]);
        match cli.command {
            Commands::Restore {
                command: RestoreCommands::Files { storage, source },
            } => {
                let flags = storage.flags();
                assert_eq!(flags.backend, Some(BackendKind::S3Compatible));
                assert_eq!(flags.bucket.as_deref(), Some("b"));
                assert_eq!(source, PathBuf::from("/tmp/s"));
            }
            _ => panic!("expected restore files"),
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["cnvrgctl", "backup", "files", "--backend", "gcs"]).is_err());
    }

    #[test]
    fn test_logs_defaults_and_tail() {
        let cli = Cli::parse_from(["cnvrgctl", "-n", "cnvrg", "logs", "--tail", "200"]);
        match cli.command {
            Commands::Logs { output, tail } => {
                assert_eq!(output, PathBuf::from("logs"));
                assert_eq!(tail, Some(200));
            }
            _ => panic!("expected logs"),
        }
    }
}
