//! # Forecast Download Module
//!
//! Fetches the GRIB2 file of every step in a day chunk. Files already on
//! disk under their deterministic name are skipped, so re-running a chunk
//! never downloads twice.
//!
//! The HTTP client streams into `{target}.partial` and renames on
//! completion; a crash mid-download therefore never leaves a truncated file
//! under the final name.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use log::{debug, info};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::forecast::{ForecastRequest, RawForecastFile};
use crate::schedule::DayChunk;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Upstream provider of forecast files.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Stores the file identified by `request` at `target` and returns its path.
    async fn fetch(&self, request: &ForecastRequest, target: &Path) -> Result<PathBuf, DownloadError>;
}

/// ECMWF open-data HTTP mirror.
#[derive(Debug, Clone)]
pub struct EcmwfOpenDataClient {
    client: Client,
    base_url: String,
}

impl EcmwfOpenDataClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(DownloadError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn url_for(&self, request: &ForecastRequest) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.remote_path()
        )
    }
}

#[async_trait]
impl ForecastSource for EcmwfOpenDataClient {
    async fn fetch(&self, request: &ForecastRequest, target: &Path) -> Result<PathBuf, DownloadError> {
        let url = self.url_for(request);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| DownloadError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url,
                status: status.as_u16(),
            });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let partial = partial_path(target);
        let mut file = File::create(&partial).await.map_err(io_error(&partial))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Http {
                url: url.clone(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_error(&partial))?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(io_error(&partial))?;
        file.sync_all().await.map_err(io_error(&partial))?;
        drop(file);

        fs::rename(&partial, target).await.map_err(io_error(target))?;
        debug!("Stored {} bytes at {}", written, target.display());

        Ok(target.to_path_buf())
    }
}

/// `{target}.partial`, matching the `*.grib2*` cleanup pattern.
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Ensures every step file of `chunk` is present in `download_dir`.
///
/// Returns the files in step order. The first fetch error aborts the chunk.
pub async fn download_chunk(
    source: &dyn ForecastSource,
    download_dir: &Path,
    reference_date: NaiveDate,
    chunk: &DayChunk,
) -> Result<Vec<RawForecastFile>, DownloadError> {
    fs::create_dir_all(download_dir)
        .await
        .map_err(io_error(download_dir))?;

    let mut files = Vec::with_capacity(chunk.offsets.len());
    let mut fetched = 0usize;

    for request in chunk.requests(reference_date) {
        let target = request.grib_path(download_dir);
        let present = fs::try_exists(&target).await.map_err(io_error(&target))?;

        let path = if present {
            info!("Skipping download, {} already exists", target.display());
            target
        } else {
            info!("Downloading {}", request);
            fetched += 1;
            source.fetch(&request, &target).await?
        };

        files.push(RawForecastFile { path, request });
    }

    debug!(
        "Day {}: {} fetched, {} already present",
        chunk.day,
        fetched,
        files.len() - fetched
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes a small placeholder and records every request.
    #[derive(Default)]
    struct CountingSource {
        fetched: Mutex<Vec<u32>>,
    }

    impl CountingSource {
        fn steps(&self) -> Vec<u32> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ForecastSource for CountingSource {
        async fn fetch(
            &self,
            request: &ForecastRequest,
            target: &Path,
        ) -> Result<PathBuf, DownloadError> {
            self.fetched.lock().unwrap().push(request.step);
            tokio::fs::write(target, b"GRIB").await.map_err(io_error(target))?;
            Ok(target.to_path_buf())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ForecastSource for FailingSource {
        async fn fetch(
            &self,
            request: &ForecastRequest,
            _target: &Path,
        ) -> Result<PathBuf, DownloadError> {
            Err(DownloadError::Status {
                url: request.remote_path(),
                status: 404,
            })
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn chunk() -> DayChunk {
        DayChunk {
            day: 1,
            offsets: vec![6, 12, 18, 24],
        }
    }

    #[tokio::test]
    async fn test_download_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::default();

        let first = download_chunk(&source, dir.path(), date(), &chunk())
            .await
            .unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(source.steps(), vec![6, 12, 18, 24]);

        let second = download_chunk(&source, dir.path(), date(), &chunk())
            .await
            .unwrap();
        assert_eq!(second, first);
        // no further fetches
        assert_eq!(source.steps().len(), 4);
    }

    #[tokio::test]
    async fn test_only_missing_steps_are_fetched() {
        let dir = TempDir::new().unwrap();
        let existing = ForecastRequest::new(date(), 12).grib_path(dir.path());
        std::fs::write(&existing, b"GRIB").unwrap();

        let source = CountingSource::default();
        let files = download_chunk(&source, dir.path(), date(), &chunk())
            .await
            .unwrap();

        assert_eq!(source.steps(), vec![6, 18, 24]);
        assert_eq!(files[1].path, existing);
        assert_eq!(files[1].request.step, 12);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts() {
        let dir = TempDir::new().unwrap();
        let result = download_chunk(&FailingSource, dir.path(), date(), &chunk()).await;
        assert!(matches!(
            result,
            Err(DownloadError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn test_url_for_request() {
        let client = EcmwfOpenDataClient::new("https://data.ecmwf.int/forecasts/").unwrap();
        let url = client.url_for(&ForecastRequest::new(date(), 6));
        assert_eq!(
            url,
            "https://data.ecmwf.int/forecasts/20240501/00z/ifs/0p25/oper/20240501000000-6h-oper-fc.grib2"
        );
    }

    #[test]
    fn test_partial_path_keeps_grib2_suffix() {
        let partial = partial_path(Path::new("/tmp/d/ecmwf_data_20240501000000_6h_oper_fc.grib2"));
        assert_eq!(
            partial,
            PathBuf::from("/tmp/d/ecmwf_data_20240501000000_6h_oper_fc.grib2.partial")
        );
    }
}
