//! # Pipeline Driver
//!
//! Runs the day chunks of a forecast horizon one after another:
//!
//! ```text
//! Idle -> Planning -> { Downloading -> Decoding -> Combining -> Publishing -> CleaningUp }* -> Done
//!                                                                               \-> Aborted
//! ```
//!
//! Every stage is awaited in order and no chunk overlaps another. The
//! download and step-table directories belong to the current chunk and are
//! emptied before the next one starts, whether the chunk succeeded or not.
//!
//! The driver never panics or returns early with an error: every failure is
//! logged with the step it happened in and folded into the [`RunReport`].

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs;

use crate::combine::{CombineError, combine_day};
use crate::download::{DownloadError, ForecastSource, download_chunk};
use crate::extract::LevelDecoder;
use crate::input::{ConfigError, PipelineConfig, PushDestination};
use crate::merge::{MergeError, MergeSettings, merge_step_table};
use crate::output::{OutputError, encode_dataframe, write_step_table};
use crate::schedule::DayChunk;
use crate::storage::{StorageBackend, StorageError, join_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Planning,
    Downloading,
    Decoding,
    Combining,
    Publishing,
    CleaningUp,
    Done,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Idle => "idle",
            PipelineState::Planning => "planning",
            PipelineState::Downloading => "download",
            PipelineState::Decoding => "decode",
            PipelineState::Combining => "combine",
            PipelineState::Publishing => "publish",
            PipelineState::CleaningUp => "cleanup",
            PipelineState::Done => "done",
            PipelineState::Aborted => "aborted",
        })
    }
}

/// A failure that aborts the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("planning failed: {0}")]
    Config(#[from] ConfigError),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("{0}")]
    Merge(#[from] MergeError),

    #[error("failed to stage step table: {0}")]
    Stage(#[source] OutputError),

    #[error("combine failed: {0}")]
    Combine(#[from] CombineError),

    #[error("failed to encode day table: {0}")]
    Encode(#[source] OutputError),

    #[error("failed to publish {location}: {source}")]
    Publish {
        location: String,
        #[source]
        source: StorageError,
    },

    #[error("cleanup of {} failed: {source}", .path.display())]
    Cleanup {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Label of the step the error happened in.
    pub fn step(&self) -> String {
        match self {
            PipelineError::Config(_) => PipelineState::Planning.to_string(),
            PipelineError::Download(_) => PipelineState::Downloading.to_string(),
            PipelineError::Merge(e) => e.step().to_string(),
            PipelineError::Stage(_) => PipelineState::Decoding.to_string(),
            PipelineError::Combine(_) => PipelineState::Combining.to_string(),
            PipelineError::Encode(_) | PipelineError::Publish { .. } => {
                PipelineState::Publishing.to_string()
            }
            PipelineError::Cleanup { .. } => PipelineState::CleaningUp.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    /// Written to the local prepped directory
    Written,
    /// Uploaded to the object store and verified
    Uploaded,
    /// Upload or verification failed; the run continued
    UploadFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayOutcome {
    pub day: usize,
    pub file_name: String,
    pub location: String,
    pub rows: usize,
    pub status: DayStatus,
}

/// Summary of a run, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// `false` when any chunk aborted the run
    pub status: bool,
    pub days: Vec<DayOutcome>,
    /// Names of the day tables uploaded to the object store
    pub uploaded: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl RunReport {
    fn new() -> Self {
        Self {
            status: true,
            days: Vec::new(),
            uploaded: Vec::new(),
            failed_step: None,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn abort(&mut self, e: &PipelineError) {
        error!("Run aborted at step '{}': {}", e.step(), e);
        self.status = false;
        self.failed_step = Some(e.step());
        self.error = Some(e.to_string());
    }
}

/// Orchestrates a run over its collaborators.
pub struct PipelineDriver<'a> {
    config: &'a PipelineConfig,
    source: &'a dyn ForecastSource,
    decoder: &'a dyn LevelDecoder,
    store: &'a dyn StorageBackend,
    state: PipelineState,
    show_progress: bool,
}

impl<'a> PipelineDriver<'a> {
    /// `store` receives the day tables: rooted at the prepped directory for
    /// the local destination, or the bucket for S3.
    pub fn new(
        config: &'a PipelineConfig,
        source: &'a dyn ForecastSource,
        decoder: &'a dyn LevelDecoder,
        store: &'a dyn StorageBackend,
    ) -> Self {
        Self {
            config,
            source,
            decoder,
            store,
            state: PipelineState::Idle,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn enter(&mut self, state: PipelineState) {
        debug!("Pipeline state: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Runs every chunk and returns the cumulative report.
    pub async fn run(&mut self) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::new();

        self.enter(PipelineState::Planning);
        let chunks = match self.config.chunks() {
            Ok(chunks) => chunks,
            Err(e) => {
                report.abort(&PipelineError::from(e));
                self.enter(PipelineState::Aborted);
                report.elapsed = start.elapsed();
                return report;
            }
        };
        info!(
            "Planned {} day(s) of {}h steps for the {} run",
            chunks.len(),
            self.config.step,
            self.config.reference_date
        );

        if self.config.clears_remote_first() {
            self.clear_remote().await;
        }

        let progress = self.progress_bar(chunks.len() as u64);

        for chunk in &chunks {
            if let Some(pb) = &progress {
                pb.set_message(format!("day {}", chunk.day));
            }
            info!("Processing day {} (steps {:?})", chunk.day, chunk.offsets);

            let outcome = self.run_chunk(chunk).await;

            self.enter(PipelineState::CleaningUp);
            let cleanup = self.cleanup().await;

            let result = outcome.and_then(|day| cleanup.map(|_| day));
            match result {
                Ok(day) => {
                    if day.status == DayStatus::Uploaded {
                        report.uploaded.push(day.file_name.clone());
                    }
                    report.days.push(day);
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                }
                Err(e) => {
                    report.abort(&e);
                    break;
                }
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        self.enter(if report.status {
            PipelineState::Done
        } else {
            PipelineState::Aborted
        });
        report.elapsed = start.elapsed();
        report
    }

    async fn run_chunk(&mut self, chunk: &DayChunk) -> Result<DayOutcome, PipelineError> {
        let config = self.config;
        let date = config.reference_date;

        self.enter(PipelineState::Downloading);
        let files = download_chunk(self.source, &config.download_dir, date, chunk).await?;

        self.enter(PipelineState::Decoding);
        let settings = MergeSettings {
            selectors: config.selectors.clone(),
            kelvin_offset: config.kelvin_offset,
            bounds: config.bounds,
        };
        for file in &files {
            let table = merge_step_table(self.decoder, file, &settings)?;
            let path = file.request.step_table_path(&config.step_dir);
            write_step_table(&table, &path).map_err(PipelineError::Stage)?;
        }

        self.enter(PipelineState::Combining);
        let day_table = combine_day(&config.step_dir, date, chunk)?;

        self.enter(PipelineState::Publishing);
        let bytes =
            encode_dataframe(&day_table, config.output_format).map_err(PipelineError::Encode)?;
        let file_name = chunk.output_file_name(date, config.output_format.extension());
        let status = self.publish(&file_name, &bytes).await?;

        Ok(DayOutcome {
            day: chunk.day,
            location: self.store.location(&self.publish_key(&file_name)),
            file_name,
            rows: day_table.height(),
            status,
        })
    }

    fn publish_key(&self, file_name: &str) -> String {
        match self.config.destination {
            PushDestination::Local => file_name.to_string(),
            PushDestination::S3 => join_key(&self.config.push_data_path, file_name),
        }
    }

    /// Local write failures abort; S3 failures only mark the day.
    async fn publish(&self, file_name: &str, bytes: &[u8]) -> Result<DayStatus, PipelineError> {
        let key = self.publish_key(file_name);
        let location = self.store.location(&key);

        match self.config.destination {
            PushDestination::Local => {
                self.store
                    .write(&key, bytes)
                    .await
                    .map_err(|source| PipelineError::Publish {
                        location: location.clone(),
                        source,
                    })?;
                info!("Saved {}", location);
                Ok(DayStatus::Written)
            }
            PushDestination::S3 => {
                if let Err(e) = self.store.write(&key, bytes).await {
                    error!("Upload of {} failed: {}", location, e);
                    return Ok(DayStatus::UploadFailed);
                }
                match self.store.exists(&key).await {
                    Ok(true) => {
                        info!("Uploaded {} ({} bytes)", location, bytes.len());
                        Ok(DayStatus::Uploaded)
                    }
                    Ok(false) => {
                        warn!("Uploaded {} but it is not visible in the bucket", location);
                        Ok(DayStatus::UploadFailed)
                    }
                    Err(e) => {
                        warn!("Could not verify upload of {}: {}", location, e);
                        Ok(DayStatus::UploadFailed)
                    }
                }
            }
        }
    }

    /// Deletes everything below the publish prefix. Failures are logged and
    /// the run proceeds.
    async fn clear_remote(&self) {
        let prefix = self.config.push_data_path.as_str();
        let keys = match self.store.list(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("Listing {} failed: {}", self.store.location(prefix), e);
                return;
            }
        };
        if keys.is_empty() {
            info!("Nothing to delete under {}", self.store.location(prefix));
            return;
        }

        match self.store.delete(&keys).await {
            Ok(report) => {
                info!(
                    "Deleted {} object(s) under {}",
                    report.deleted.len(),
                    self.store.location(prefix)
                );
                for (key, message) in &report.errors {
                    warn!("Could not delete {}: {}", key, message);
                }
            }
            Err(e) => error!("Deleting under {} failed: {}", self.store.location(prefix), e),
        }
    }

    /// Removes downloaded files and staged step tables.
    async fn cleanup(&self) -> Result<usize, PipelineError> {
        let downloads = remove_matching(&self.config.download_dir, |name| {
            name.contains(".grib2")
        })
        .await?;
        let staged = remove_matching(&self.config.step_dir, |name| name.ends_with(".csv")).await?;
        debug!(
            "Cleanup removed {} download(s) and {} step table(s)",
            downloads, staged
        );
        Ok(downloads + staged)
    }

    fn progress_bar(&self, total: u64) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    }
}

/// Deletes the files in `dir` whose name satisfies `matches`. A missing
/// directory counts as clean.
async fn remove_matching(
    dir: &Path,
    matches: impl Fn(&str) -> bool,
) -> Result<usize, PipelineError> {
    let cleanup_error = |source| PipelineError::Cleanup {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(cleanup_error(e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(cleanup_error)? {
        let name = entry.file_name();
        if !matches(&name.to_string_lossy()) {
            continue;
        }
        if entry.file_type().await.map_err(cleanup_error)?.is_file() {
            fs::remove_file(entry.path()).await.map_err(cleanup_error)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_error_steps() {
        let e = PipelineError::Download(DownloadError::Status {
            url: "x".to_string(),
            status: 500,
        });
        assert_eq!(e.step(), "download");

        let e = PipelineError::Combine(CombineError::EmptyChunk);
        assert_eq!(e.step(), "combine");

        let e = PipelineError::Merge(MergeError::NoLevels);
        assert_eq!(e.step(), "filter levels");
    }

    #[tokio::test]
    async fn test_remove_matching() {
        let dir = TempDir::new().unwrap();
        for name in ["a.grib2", "a.grib2.partial", "a.grib2.5b7b6.idx", "keep.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = remove_matching(dir.path(), |n| n.contains(".grib2"))
            .await
            .unwrap();
        assert_eq!(removed, 3);

        let left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn test_remove_matching_missing_dir() {
        let dir = TempDir::new().unwrap();
        let removed = remove_matching(&dir.path().join("absent"), |_| true)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
