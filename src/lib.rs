//! # grib2csv
//!
//! A Rust library and CLI that turns the ECMWF open-data GRIB2 forecast into
//! regional day tables, one column per forecast hour.
//!
//! ## Features
//!
//! - **Chunked horizon**: the forecast hours are split into day chunks that
//!   are downloaded, decoded, combined and cleaned up one at a time
//! - **Idempotent downloads**: files already on disk are never fetched twice
//! - **Keyed merging**: level tables and forecast steps are aligned on
//!   (latitude, longitude), never on row order
//! - **Regional filtering**: the region is given as degree-minute-second
//!   edges in a YAML file
//! - **Local or S3 publishing**: CSV or Parquet, with upload verification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use grib2csv::{run_pipeline, cli::Cli, input::RegionConfig};
//! use clap::Parser;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cli = Cli::parse_from(["grib2csv", "--number-of-days", "2"]);
//! let region = RegionConfig::from_file("gribcfg.yaml")?;
//! let config = cli.to_pipeline_config(&region)?;
//!
//! let report = run_pipeline(&config, false).await?;
//! println!("published {} day(s)", report.days.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! coords:
//!   north: "28°15'N"
//!   south: "26°42'N"
//!   east: "92°7'E"
//!   west: "88°44'E"
//! coords_map:
//!   north: max_lat_region
//!   south: min_lat_region
//!   east: max_lon_region
//!   west: min_lon_region
//! s3:
//!   bucket_name: my-feed
//!   s3_region: ap-south-1
//! ```

pub mod cli;
pub mod combine;
pub mod download;
pub mod extract;
pub mod filters;
pub mod forecast;
pub mod input;
pub mod log;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod schedule;
pub mod storage;


use crate::download::EcmwfOpenDataClient;
use crate::extract::GribLevelDecoder;
use crate::input::{ConfigError, PipelineConfig, PushDestination};
use crate::pipeline::{PipelineDriver, PipelineError, RunReport};
use crate::storage::{LocalStorage, S3Storage, Storage};

/// Runs the pipeline against the ECMWF open-data mirror and the configured
/// destination.
///
/// # Errors
///
/// Only setup failures are returned (HTTP client, missing bucket settings).
/// Failures during the run are reported through [`RunReport::status`].
pub async fn run_pipeline(
    config: &PipelineConfig,
    show_progress: bool,
) -> Result<RunReport, PipelineError> {
    let source = EcmwfOpenDataClient::new(&config.source_url)?;
    let decoder = GribLevelDecoder;
    let store = match config.destination {
        PushDestination::Local => Storage::Local(LocalStorage::new(&config.publish_dir)),
        PushDestination::S3 => {
            let settings = config
                .s3
                .as_ref()
                .ok_or_else(|| ConfigError::MissingS3Settings("the region file".to_string()))?;
            Storage::S3(S3Storage::from_settings(settings).await)
        }
    };

    let mut driver =
        PipelineDriver::new(config, &source, &decoder, &store).with_progress(show_progress);
    Ok(driver.run().await)
}
