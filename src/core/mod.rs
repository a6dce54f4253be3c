pub mod cluster;
pub mod credentials;
pub mod database;
pub mod error;
pub mod exec;
pub mod logs;
pub mod resolver;
pub mod scaler;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod tunnel;
pub mod workflows;

#[cfg(test)]
pub(crate) mod fake;

pub use cluster::{ClusterApi, KubeCluster};
pub use database::PostgresConnector;
pub use error::{BackupError, ErrorKind};
pub use logs::LogCollector;
pub use storage::SdkStoreOpener;
pub use workflows::{BackupEngine, EngineSettings};
