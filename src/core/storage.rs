/// Object storage backends
///
/// `ObjectStoreClient` is the list/get/put capability the synchronizer needs. There is
/// one implementation per backend kind, chosen once when credentials are resolved.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::core::error::{BackupError, Result};

const DEFAULT_REGION: &str = "us-east-1";

/// Object storage wire dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// AWS S3
    S3Native,
    /// MinIO and other S3-compatible servers
    S3Compatible,
}

impl FromStr for BackendKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "aws" | "s3" | "s3-native" => Ok(Self::S3Native),
            "minio" | "s3-compatible" => Ok(Self::S3Compatible),
            other => Err(BackupError::credential(format!(
                "unsupported storage type '{}', expected aws or minio",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3Native => write!(f, "s3-native"),
            Self::S3Compatible => write!(f, "s3-compatible"),
        }
    }
}

/// Resolved bucket coordinates and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStoreTarget {
    pub endpoint_url: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub bucket: String,
    pub region: Option<String>,
    pub backend: BackendKind,
}

impl fmt::Debug for ObjectStoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreTarget")
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("backend", &self.backend)
            .finish()
    }
}

impl ObjectStoreTarget {
    fn region(&self) -> String {
        self.region
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string()
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            self.session_token.clone(),
            None,
            "cnvrgctl",
        )
    }
}

/// Add a scheme to endpoints given as bare host[:port]
///
/// In-cluster MinIO serves plain HTTP, so S3-compatible endpoints default to
/// `http://`; AWS endpoints default to `https://`.
pub fn normalize_endpoint(endpoint: &str, backend: BackendKind) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    match backend {
        BackendKind::S3Native => format!("https://{}", endpoint),
        BackendKind::S3Compatible => format!("http://{}", endpoint),
    }
}

/// One object in a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every object in the bucket, recursively
    async fn list(&self) -> Result<Vec<ObjectEntry>>;

    /// Download `key` into `destination`, returning the byte count
    async fn get(&self, key: &str, destination: &Path) -> Result<u64>;

    /// Upload `source` under `key`, returning the byte count
    async fn put(&self, key: &str, source: &Path) -> Result<u64>;
}

/// Build the client for a resolved target
pub fn open_store(target: &ObjectStoreTarget) -> Arc<dyn ObjectStoreClient> {
    match target.backend {
        BackendKind::S3Native => Arc::new(AwsStore::new(target)),
        BackendKind::S3Compatible => Arc::new(MinioStore::new(target)),
    }
}

/// Chooses the client for a target; replaced in tests
pub trait StoreOpener: Send + Sync {
    fn open(&self, target: &ObjectStoreTarget) -> Arc<dyn ObjectStoreClient>;
}

pub struct SdkStoreOpener;

impl StoreOpener for SdkStoreOpener {
    fn open(&self, target: &ObjectStoreTarget) -> Arc<dyn ObjectStoreClient> {
        open_store(target)
    }
}

/// AWS S3, virtual-hosted addressing
pub struct AwsStore {
    client: Client,
    bucket: String,
}

impl AwsStore {
    pub fn new(target: &ObjectStoreTarget) -> Self {
        let mut config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(target.region()))
            .credentials_provider(target.credentials());
        if !target.endpoint_url.trim().is_empty() {
            config = config.endpoint_url(normalize_endpoint(&target.endpoint_url, target.backend));
        }
        Self {
            client: Client::from_conf(config.build()),
            bucket: target.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for AwsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>> {
        list_objects(&self.client, &self.bucket).await
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<u64> {
        get_object(&self.client, &self.bucket, key, destination).await
    }

    async fn put(&self, key: &str, source: &Path) -> Result<u64> {
        put_object(&self.client, &self.bucket, key, source).await
    }
}

/// MinIO, path-style addressing against an explicit endpoint
pub struct MinioStore {
    client: Client,
    bucket: String,
}

impl MinioStore {
    pub fn new(target: &ObjectStoreTarget) -> Self {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(target.region()))
            .credentials_provider(target.credentials())
            .endpoint_url(normalize_endpoint(&target.endpoint_url, target.backend))
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: target.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for MinioStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>> {
        list_objects(&self.client, &self.bucket).await
    }

    async fn get(&self, key: &str, destination: &Path) -> Result<u64> {
        get_object(&self.client, &self.bucket, key, destination).await
    }

    async fn put(&self, key: &str, source: &Path) -> Result<u64> {
        put_object(&self.client, &self.bucket, key, source).await
    }
}

fn sdk_error(operation: String, err: impl std::error::Error) -> BackupError {
    BackupError::transport(operation, DisplayErrorContext(err).to_string())
}

async fn list_objects(client: &Client, bucket: &str) -> Result<Vec<ObjectEntry>> {
    let mut pages = client
        .list_objects_v2()
        .bucket(bucket)
        .into_paginator()
        .send();

    let mut entries = Vec::new();
    while let Some(page) = pages.next().await {
        let page = page.map_err(|e| sdk_error(format!("listing bucket {}", bucket), e))?;
        for object in page.contents() {
            if let Some(key) = object.key() {
                entries.push(ObjectEntry {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
    }

    debug!(bucket = %bucket, objects = entries.len(), "Listed bucket");
    Ok(entries)
}

async fn get_object(client: &Client, bucket: &str, key: &str, destination: &Path) -> Result<u64> {
    let output = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| sdk_error(format!("downloading s3://{}/{}", bucket, key), e))?;

    let file = File::create(destination)
        .await
        .map_err(|e| BackupError::transfer("creating", destination, e))?;
    let mut writer = BufWriter::new(file);
    let mut body = output.body;
    let mut written = 0u64;

    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(|e| BackupError::transfer(format!("downloading s3://{}/{} into", bucket, key), destination, e))?
    {
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| BackupError::transfer("writing", destination, e))?;
        written += chunk.len() as u64;
    }
    writer
        .flush()
        .await
        .map_err(|e| BackupError::transfer("writing", destination, e))?;

    Ok(written)
}

async fn put_object(client: &Client, bucket: &str, key: &str, source: &Path) -> Result<u64> {
    let size = fs::metadata(source)
        .await
        .map_err(|e| BackupError::transfer("reading size of", source, e))?
        .len();
    let body = ByteStream::from_path(source)
        .await
        .map_err(|e| BackupError::transfer("opening", source, e))?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .map_err(|e| sdk_error(format!("uploading {} to s3://{}/{}", source.display(), bucket, key), e))?;

    Ok(size)
}
