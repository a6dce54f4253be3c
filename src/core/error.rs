/// Error taxonomy for the backup/restore engine
///
/// Every component returns `BackupError` to its caller with the operation and
/// target already spelled out. The CLI layer wraps these in `anyhow` for exit handling.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse category of a `BackupError`, used for matching without destructuring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Transport,
    RemoteExecution,
    Sql,
    Transfer,
    Credential,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// No running pod matched the selector
    #[error("no running pods match {selector} in namespace {namespace}; check the namespace and label")]
    NoMatch { namespace: String, selector: String },

    /// More than one running pod matched the selector
    #[error(
        "{} running pods match {selector} in namespace {namespace} ({}); use a more precise target or label",
        candidates.len(),
        candidates.join(", ")
    )]
    AmbiguousTarget {
        namespace: String,
        selector: String,
        candidates: Vec<String>,
    },

    /// Control-plane, exec or port-forward endpoint could not be reached
    #[error("{operation} failed")]
    Transport {
        operation: String,
        #[source]
        source: BoxError,
    },

    /// Remote command exited non-zero or its stream broke mid-flight
    #[error("remote command `{command}` on {target} failed: {reason}")]
    RemoteExecution {
        target: String,
        command: String,
        reason: String,
    },

    #[error("sql statement `{statement}` failed")]
    Sql {
        statement: String,
        #[source]
        source: BoxError,
    },

    /// Local I/O or object transfer failure
    #[error("{operation} {} failed", path.display())]
    Transfer {
        operation: String,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("invalid object storage credentials: {0}")]
    Credential(String),

    #[error("timed out after {} waiting for {operation}", humantime::format_duration(*elapsed))]
    Timeout { operation: String, elapsed: Duration },
}

impl BackupError {
    pub fn transport(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn sql(statement: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Sql {
            statement: statement.into(),
            source: source.into(),
        }
    }

    pub fn transfer(
        operation: impl Into<String>,
        path: impl AsRef<Path>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transfer {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            source: source.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMatch { .. } | Self::AmbiguousTarget { .. } => ErrorKind::Resolution,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            Self::Sql { .. } => ErrorKind::Sql,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Credential(_) => ErrorKind::Credential,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_message_is_actionable() {
        let err = BackupError::NoMatch {
            namespace: "cnvrg".to_string(),
            selector: "app=postgres".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("app=postgres"));
        assert!(msg.contains("check the namespace and label"));
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = BackupError::AmbiguousTarget {
            namespace: "cnvrg".to_string(),
            selector: "app=redis".to_string(),
            candidates: vec!["redis-0".to_string(), "redis-1".to_string()],
        };
        assert!(err.to_string().starts_with("2 running pods"));
        assert!(err.to_string().contains("redis-0, redis-1"));
    }

    #[test]
    fn test_transfer_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = BackupError::transfer("writing", "/tmp/out.sql", io);
        assert_eq!(err.to_string(), "writing /tmp/out.sql failed");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "denied");
        assert_eq!(err.kind(), ErrorKind::Transfer);
    }

    #[test]
    fn test_timeout_formats_duration() {
        let err = BackupError::timeout("tunnel readiness", Duration::from_secs(30));
        assert_eq!(err.to_string(), "timed out after 30s waiting for tunnel readiness");
    }
}
