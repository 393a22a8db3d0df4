//! # Storage Abstraction Module
//!
//! This module provides a unified key-based interface for publishing tables
//! to the local filesystem or to an Amazon S3 bucket. The pipeline writes
//! the day tables through [`StorageBackend`] regardless of destination.
//!
//! ## Features
//!
//! - **Unified API**: Same interface for local and S3 operations
//! - **Prefix listing and batch deletion**: Used to clear a publish prefix
//!   before a run
//! - **Async operations**: Full async support for all storage operations
//! - **Credential management**: Static credentials from the run configuration,
//!   falling back to the default AWS provider chain
//!
//! ## Keys
//!
//! - **Local**: relative paths below the storage root, `/` separated
//! - **S3**: object keys inside the configured bucket
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use grib2csv::storage::{LocalStorage, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = LocalStorage::new("./prepped");
//!     storage.write("ecmwf_data_20240101000000_6121824h_oper_fc_1.csv", b"a,b\n").await?;
//!     let keys = storage.list("ecmwf_data_").await?;
//!     storage.delete(&keys).await?;
//!     Ok(())
//! }
//! ```

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use log::{debug, warn};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::input::S3Settings;

/// Maximum keys accepted by a single DeleteObjects request.
const DELETE_BATCH: usize = 1000;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AWS S3 GetObject error: {0}")]
    S3GetObject(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>),

    #[error("AWS S3 PutObject error: {0}")]
    S3PutObject(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>),

    #[error("AWS S3 HeadObject error: {0}")]
    S3HeadObject(#[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>),

    #[error("AWS S3 ListObjectsV2 error: {0}")]
    S3ListObjects(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    ),

    #[error("AWS S3 DeleteObjects error: {0}")]
    S3DeleteObjects(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::delete_objects::DeleteObjectsError>,
    ),

    #[error("AWS S3 request build error: {0}")]
    Build(#[from] aws_sdk_s3::error::BuildError),

    #[error("AWS ByteStream error: {0}")]
    ByteStream(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a batch delete. Per-key failures do not fail the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    /// `(key, message)` for every key that could not be deleted
    pub errors: Vec<(String, String)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Trait defining the interface for storage backends
///
/// All operations are async to support both local and remote operations.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the entire contents of an object
    ///
    /// # Errors
    /// Returns `StorageError::PathNotFound` if the key does not exist
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Writes data to an object, replacing any existing content
    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Checks if an object exists at the given key
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Lists every key starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Deletes the given keys, reporting per-key failures
    async fn delete(&self, keys: &[String]) -> StorageResult<DeleteReport>;

    /// Human-readable location of a key, for logs
    fn location(&self, key: &str) -> String;
}

/// Local filesystem storage backend
///
/// Keys are resolved below `root` using tokio's async file operations.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path, rejecting absolute and parent components
    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> StorageResult<()> {
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::PathNotFound(path.display().to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied(path.display().to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.resolve(key)?;
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(StorageError::Io)?;
        }

        match fs::write(&path, data).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::PermissionDenied(path.display().to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<DeleteReport> {
        let mut report = DeleteReport::default();
        for key in keys {
            let outcome = match self.resolve(key) {
                Ok(path) => fs::remove_file(&path).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(()) => report.deleted.push(key.clone()),
                Err(message) => report.errors.push((key.clone(), message)),
            }
        }
        Ok(report)
    }

    fn location(&self, key: &str) -> String {
        self.root.join(key).display().to_string()
    }
}

/// Amazon S3 storage backend bound to one bucket
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    /// Creates a client from the run's S3 settings.
    ///
    /// Static credentials are used when both keys are present; otherwise
    /// credentials come from the default AWS chain (environment variables,
    /// credentials file, IAM roles).
    pub async fn from_settings(settings: &S3Settings) -> Self {
        let region = Region::new(settings.s3_region.clone());
        let client = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "grib2csv-config");
                let config = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
                    .build();
                S3Client::from_conf(config)
            }
            _ => {
                debug!("No static S3 credentials configured, using default provider chain");
                let config = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                S3Client::new(&config)
            }
        };

        Self {
            client,
            bucket: settings.bucket_name.clone(),
        }
    }

    /// Wraps an already configured client
    pub fn from_client(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Storage {
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                aws_sdk_s3::error::SdkError::ServiceError(service_err)
                    if service_err.err().is_no_such_key() =>
                {
                    StorageError::PathNotFound(self.location(key))
                }
                _ => StorageError::S3GetObject(e),
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::ByteStream(e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(data)
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(StorageError::S3PutObject)?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(aws_sdk_s3::error::SdkError::ServiceError(service_err))
                if service_err.err().is_not_found() =>
            {
                Ok(false)
            }
            Err(e) => Err(StorageError::S3HeadObject(e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref token) = continuation_token {
                request = request.continuation_token(token.clone());
            }

            let response = request.send().await?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<DeleteReport> {
        let mut report = DeleteReport::default();

        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(false)
                .build()?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await?;

            report.deleted.extend(
                response
                    .deleted()
                    .iter()
                    .filter_map(|d| d.key().map(str::to_string)),
            );
            for error in response.errors() {
                let key = error.key().unwrap_or_default().to_string();
                let message = error.message().unwrap_or("unknown error").to_string();
                warn!("Failed to delete {}: {}", self.location(&key), message);
                report.errors.push((key, message));
            }
        }

        Ok(report)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

/// Storage backend enumeration
///
/// Represents the different types of storage backends available.
#[derive(Debug)]
pub enum Storage {
    Local(LocalStorage),
    S3(S3Storage),
}

#[async_trait::async_trait]
impl StorageBackend for Storage {
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        match self {
            Storage::Local(storage) => storage.read(key).await,
            Storage::S3(storage) => storage.read(key).await,
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        match self {
            Storage::Local(storage) => storage.write(key, data).await,
            Storage::S3(storage) => storage.write(key, data).await,
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self {
            Storage::Local(storage) => storage.exists(key).await,
            Storage::S3(storage) => storage.exists(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        match self {
            Storage::Local(storage) => storage.list(prefix).await,
            Storage::S3(storage) => storage.list(prefix).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<DeleteReport> {
        match self {
            Storage::Local(storage) => storage.delete(keys).await,
            Storage::S3(storage) => storage.delete(keys).await,
        }
    }

    fn location(&self, key: &str) -> String {
        match self {
            Storage::Local(storage) => storage.location(key),
            Storage::S3(storage) => storage.location(key),
        }
    }
}

/// Joins a key prefix and a file name with a single `/`.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::localstack::LocalStack;

    #[tokio::test]
    #[ignore] // Requires a Docker daemon
    async fn test_s3_storage_localstack() -> Result<(), Box<dyn std::error::Error>> {
        let node = LocalStack::default().start().await?;
        let host = node.get_host().await?;
        let port = node.get_host_port_ipv4(4566).await?;

        let credentials =
            aws_credential_types::Credentials::new("test", "test", None, None, "localstack");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(format!("http://{}:{}", host, port))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        let client = S3Client::from_conf(config);
        client.create_bucket().bucket("feed").send().await?;

        let storage = S3Storage::from_client(client, "feed");
        let key = join_key("daily", "ecmwf_data_20240101000000_6121824h_oper_fc_1.csv");

        storage.write(&key, b"longitude,latitude\n").await?;
        assert!(storage.exists(&key).await?);
        assert_eq!(storage.read(&key).await?, b"longitude,latitude\n");
        assert_eq!(storage.list("daily/").await?, vec![key.clone()]);

        let report = storage.delete(&[key.clone()]).await?;
        assert_eq!(report.deleted, vec![key.clone()]);
        assert!(!storage.exists(&key).await?);

        Ok(())
    }

    #[tokio::test]
    #[ignore] // Ignore by default as it requires AWS credentials and S3 access
    async fn test_s3_storage_real_aws() -> Result<(), Box<dyn std::error::Error>> {
        // Set TEST_S3_BUCKET and AWS_DEFAULT_REGION plus the usual AWS credentials
        let test_bucket = match std::env::var("TEST_S3_BUCKET") {
            Ok(bucket) => bucket,
            Err(_) => {
                println!("Skipping S3 integration test - set TEST_S3_BUCKET environment variable");
                return Ok(());
            }
        };
        let region = std::env::var("AWS_DEFAULT_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        let settings = S3Settings {
            bucket_name: test_bucket.clone(),
            s3_region: region,
            access_key_id: None,
            secret_access_key: None,
        };
        let storage = S3Storage::from_settings(&settings).await;
        let key = "test-integration/grib2csv.txt";

        storage.write(key, b"Integration test data for real S3").await?;
        assert!(storage.exists(key).await?);
        assert_eq!(storage.read(key).await?, b"Integration test data for real S3");
        storage.delete(&[key.to_string()]).await?;

        println!("S3 integration test passed with bucket: {}", test_bucket);
        Ok(())
    }
}
