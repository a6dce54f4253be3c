/// Object storage credential resolution
///
/// Credentials come either from a cluster secret or from explicit flags, never a
/// mix of the two. The backend kind is fixed here and drives which store client
/// gets built.

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::cluster::ClusterApi;
use crate::core::error::{BackupError, Result};
use crate::core::storage::{BackendKind, ObjectStoreTarget};
use crate::utils::helpers::mask_sensitive;

pub const STORAGE_ENDPOINT: &str = "CNVRG_STORAGE_ENDPOINT";
pub const STORAGE_ACCESS_KEY: &str = "CNVRG_STORAGE_ACCESS_KEY";
pub const STORAGE_SECRET_KEY: &str = "CNVRG_STORAGE_SECRET_KEY";
pub const STORAGE_REGION: &str = "CNVRG_STORAGE_REGION";
pub const STORAGE_TYPE: &str = "CNVRG_STORAGE_TYPE";
pub const STORAGE_BUCKET: &str = "CNVRG_STORAGE_BUCKET";

/// Explicit object storage settings given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageFlags {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub session_token: Option<String>,
    pub backend: Option<BackendKind>,
}

impl StorageFlags {
    fn any_set(&self) -> bool {
        self.endpoint.is_some()
            || self.access_key.is_some()
            || self.secret_key.is_some()
            || self.bucket.is_some()
            || self.region.is_some()
            || self.session_token.is_some()
            || self.backend.is_some()
    }
}

/// Where a workflow's credentials come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Secret { namespace: String, name: String },
    Explicit(StorageFlags),
}

impl CredentialSource {
    /// Explicit flags win when any is given; otherwise the named secret is used
    pub fn select(flags: StorageFlags, namespace: &str, secret_name: &str) -> Self {
        if flags.any_set() {
            Self::Explicit(flags)
        } else {
            Self::Secret {
                namespace: namespace.to_string(),
                name: secret_name.to_string(),
            }
        }
    }

    pub async fn resolve(&self, cluster: &dyn ClusterApi) -> Result<ObjectStoreTarget> {
        match self {
            Self::Explicit(flags) => target_from_flags(flags),
            Self::Secret { namespace, name } => {
                let data = cluster.get_secret(namespace, name).await?.ok_or_else(|| {
                    BackupError::credential(format!(
                        "secret {} not found in namespace {}",
                        name, namespace
                    ))
                })?;
                let target = target_from_secret(name, &data)?;
                debug!(
                    secret = %name,
                    backend = %target.backend,
                    bucket = %target.bucket,
                    access_key = %mask_sensitive(&target.access_key, 4),
                    "Resolved storage credentials"
                );
                Ok(target)
            }
        }
    }
}

fn required(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validate flags: endpoint, access key, secret key and bucket go together
pub fn target_from_flags(flags: &StorageFlags) -> Result<ObjectStoreTarget> {
    let endpoint = required(&flags.endpoint);
    let access_key = required(&flags.access_key);
    let secret_key = required(&flags.secret_key);
    let bucket = required(&flags.bucket);

    let missing: Vec<&str> = [
        ("--endpoint", endpoint.is_none()),
        ("--access-key", access_key.is_none()),
        ("--secret-key", secret_key.is_none()),
        ("--bucket", bucket.is_none()),
    ]
    .iter()
    .filter(|(_, absent)| *absent)
    .map(|(flag, _)| *flag)
    .collect();

    match (endpoint, access_key, secret_key, bucket) {
        (Some(endpoint_url), Some(access_key), Some(secret_key), Some(bucket)) => Ok(ObjectStoreTarget {
            endpoint_url,
            access_key,
            secret_key,
            session_token: required(&flags.session_token),
            bucket,
            region: required(&flags.region),
            backend: flags.backend.unwrap_or(BackendKind::S3Compatible),
        }),
        _ => Err(BackupError::credential(format!(
            "explicit storage flags are incomplete, missing {}",
            missing.join(", ")
        ))),
    }
}

fn secret_field(secret: &str, data: &BTreeMap<String, Vec<u8>>, key: &str) -> Result<Option<String>> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => {
            let value = String::from_utf8(raw.clone()).map_err(|_| {
                BackupError::credential(format!("secret {} field {} is not valid UTF-8", secret, key))
            })?;
            let value = value.trim().to_string();
            Ok(if value.is_empty() { None } else { Some(value) })
        }
    }
}

fn secret_required(secret: &str, data: &BTreeMap<String, Vec<u8>>, key: &str) -> Result<String> {
    secret_field(secret, data, key)?
        .ok_or_else(|| BackupError::credential(format!("secret {} is missing {}", secret, key)))
}

/// Read a storage target from the cnvrg object storage secret
pub fn target_from_secret(secret: &str, data: &BTreeMap<String, Vec<u8>>) -> Result<ObjectStoreTarget> {
    let backend: BackendKind = secret_required(secret, data, STORAGE_TYPE)?.parse()?;
    let access_key = secret_required(secret, data, STORAGE_ACCESS_KEY)?;
    let secret_key = secret_required(secret, data, STORAGE_SECRET_KEY)?;
    let bucket = secret_required(secret, data, STORAGE_BUCKET)?;
    let region = secret_field(secret, data, STORAGE_REGION)?;

    // AWS can derive the endpoint from the region; MinIO cannot
    let endpoint_url = match backend {
        BackendKind::S3Compatible => secret_required(secret, data, STORAGE_ENDPOINT)?,
        BackendKind::S3Native => secret_field(secret, data, STORAGE_ENDPOINT)?.unwrap_or_default(),
    };

    Ok(ObjectStoreTarget {
        endpoint_url,
        access_key,
        secret_key,
        session_token: None,
        bucket,
        region,
        backend,
    })
}

/// Read one string field from a secret, e.g. the redis password
pub async fn read_secret_value(cluster: &dyn ClusterApi, namespace: &str, name: &str, key: &str) -> Result<String> {
    let data = cluster.get_secret(namespace, name).await?.ok_or_else(|| {
        BackupError::credential(format!("secret {} not found in namespace {}", name, namespace))
    })?;
    secret_required(name, &data, key)
}
