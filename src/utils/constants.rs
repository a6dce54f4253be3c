/// cnvrg.io deployment layout and defaults
///
/// Names, paths and secret keys used by a standard cnvrg control plane install

use std::time::Duration;

/// Workloads that hold connections to postgres and redis, in start-up order
pub const DEFAULT_WORKLOADS: &[&str] = &["app", "sidekiq", "systemkiq", "searchkiq", "cnvrg-operator"];

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_LABEL_KEY: &str = "app";

pub const SCALE_DOWN_REPLICAS: i32 = 0;
pub const SCALE_UP_REPLICAS: i32 = 1;

pub const DEFAULT_SCALE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory the logs command writes `<pod>.txt` files into
pub const DEFAULT_LOGS_DIR: &str = "logs";

// Postgres
pub const POSTGRES_DEPLOYMENT: &str = "postgres";
pub const POSTGRES_BACKUP_FILE: &str = "cnvrg-db-backup.sql";
pub const POSTGRES_REMOTE_DUMP: &str = "/opt/app-root/src/cnvrg-db-backup.sql";
pub const POSTGRES_USER: &str = "cnvrg";
pub const POSTGRES_DATABASE: &str = "cnvrg_production";
pub const POSTGRES_ADMIN_DATABASE: &str = "postgres";
pub const POSTGRES_PORT: u16 = 5432;
pub const POSTGRES_RESTORE_JOBS: u32 = 8;

// Redis
pub const REDIS_DEPLOYMENT: &str = "redis";
pub const REDIS_BACKUP_FILE: &str = "dump.rdb";
pub const REDIS_REMOTE_DUMP: &str = "/data/dump.rdb";
pub const REDIS_APPENDONLY_FILE: &str = "/data/appendonly.aof";
pub const REDIS_SECRET: &str = "redis-creds";
pub const REDIS_PASSWORD_KEY: &str = "CNVRG_REDIS_PASSWORD";
pub const REDIS_CONF_KEY: &str = "redis.conf";
pub const REDIS_PORT: u16 = 6379;

// Object storage
pub const STORAGE_SECRET: &str = "cp-object-storage";
pub const STORAGE_ROOT: &str = "cnvrg-storage";

/// Default local directory for dump files
pub const DEFAULT_FILE_LOCATION: &str = ".";

pub fn default_workloads() -> Vec<String> {
    DEFAULT_WORKLOADS.iter().map(|w| w.to_string()).collect()
}
