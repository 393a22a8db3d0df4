//! # CLI Module
//!
//! This module provides the command-line interface for grib2csv, including:
//! - Argument parsing with clap
//! - Environment variable support with the GRIB2CSV_ prefix
//! - Parsing of the filter-level list and the Y/N delete flag
//! - Resolution of the arguments and region file into a [`PipelineConfig`]

use crate::extract::{LevelKind, LevelSelector};
use crate::input::{
    ConfigError, DEFAULT_SOURCE_URL, PipelineConfig, PushDestination, RegionConfig,
    parse_level_kinds,
};
use crate::merge::KELVIN_OFFSET;
use crate::output::OutputFormat;
use chrono::{Days, Local, NaiveDate};
use clap::Parser;
use std::fmt;
use std::path::PathBuf;

/// Serializes tests that touch process environment variables
#[cfg(test)]
pub(crate) static ENV_TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Daily ECMWF open-data forecast pipeline: GRIB2 to regional CSV tables
#[derive(Parser, Debug)]
#[command(name = "grib2csv")]
#[command(about = "Download ECMWF forecasts and publish regional day tables as CSV or Parquet")]
#[command(version)]
#[command(long_about = "
grib2csv downloads the operational ECMWF 00 UTC forecast for a multi-day horizon,
cuts out the region configured in the YAML file and publishes one table per day
with one column per forecast hour.

PIPELINE (per day):
  download -> decode levels -> merge on (latitude, longitude) -> combine -> publish -> cleanup

EXAMPLES:
  # Five days of 6-hourly steps, written to ./prepped
  grib2csv

  # Publish to S3, clearing the prefix first
  grib2csv --push-destination s3 --push-data-path ecmwf/daily --delete-s3-files-flag Y

  # Backfill a given run as Parquet
  grib2csv --reference-date 2024-05-01 --output-format parquet

  # Three-hourly steps including pressure levels
  grib2csv --step-counter 3 --filter-levels 'surface, heightAboveGround, isobaricInhPa'
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Directory for downloaded GRIB2 files, below the temp dir
    #[arg(long, env = "GRIB2CSV_DOWNLOAD_PATH", default_value = "./download")]
    pub download_path: PathBuf,

    /// Directory for the published day tables
    #[arg(long, env = "GRIB2CSV_PREPPED_PATH", default_value = "./prepped")]
    pub prepped_path: PathBuf,

    /// Sub-directory of the prepped path for per-step tables
    #[arg(long, env = "GRIB2CSV_PREPPED_SUFFIX", default_value = "temp")]
    pub prepped_suffix: String,

    /// Comma-separated level kinds, e.g. "surface, heightAboveGround"
    #[arg(
        long,
        env = "GRIB2CSV_FILTER_LEVELS",
        default_value = "surface, heightAboveGround",
        value_parser = parse_filter_levels
    )]
    pub filter_levels: FilterLevels,

    /// Height above ground in metres for heightAboveGround records
    #[arg(long, env = "GRIB2CSV_LEVEL", default_value_t = 2)]
    pub level: u32,

    /// Number of forecast days
    #[arg(long, env = "GRIB2CSV_NUMBER_OF_DAYS", default_value_t = 5)]
    pub number_of_days: u32,

    /// Forecast step in hours (1-24)
    #[arg(long, env = "GRIB2CSV_STEP_COUNTER", default_value_t = 6)]
    pub step_counter: u32,

    /// Where the day tables are published
    #[arg(long, env = "GRIB2CSV_PUSH_DESTINATION", value_enum, default_value_t = PushDestination::Local)]
    pub push_destination: PushDestination,

    /// Key prefix for objects published to S3
    #[arg(long, env = "GRIB2CSV_PUSH_DATA_PATH", default_value = "")]
    pub push_data_path: String,

    /// Region and bucket configuration (YAML or JSON)
    #[arg(long, env = "GRIB2CSV_YAML_FILE", default_value = "gribcfg.yaml")]
    pub yaml_file: PathBuf,

    /// Delete existing objects under the push data path before the run (Y/N)
    #[arg(
        long,
        env = "GRIB2CSV_DELETE_S3_FILES_FLAG",
        default_value = "Y",
        action = clap::ArgAction::Set,
        value_parser = parse_yes_no
    )]
    pub delete_s3_files_flag: bool,

    /// Root for the download and step-table directories
    #[arg(long, env = "TEMP_DIR", default_value = "/tmp")]
    pub temp_dir: PathBuf,

    /// Reference run date (YYYY-MM-DD); defaults to yesterday
    #[arg(long, env = "GRIB2CSV_REFERENCE_DATE", value_parser = parse_reference_date)]
    pub reference_date: Option<NaiveDate>,

    /// File format of the day tables
    #[arg(long, env = "GRIB2CSV_OUTPUT_FORMAT", value_enum, default_value_t = OutputFormat::Csv)]
    pub output_format: OutputFormat,

    /// Root URL of the ECMWF open-data mirror
    #[arg(long, env = "GRIB2CSV_SOURCE_URL", default_value = DEFAULT_SOURCE_URL)]
    pub source_url: String,
}

/// Parsed `--filter-levels` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLevels(pub Vec<LevelKind>);

impl fmt::Display for FilterLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|k| k.name()).collect();
        f.write_str(&names.join(", "))
    }
}

fn parse_filter_levels(s: &str) -> Result<FilterLevels, String> {
    parse_level_kinds(s).map(FilterLevels)
}

fn parse_yes_no(s: &str) -> Result<bool, String> {
    match s.trim() {
        "Y" | "y" => Ok(true),
        "N" | "n" => Ok(false),
        other => Err(format!("Expected Y or N, got '{}'", other)),
    }
}

fn parse_reference_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| format!("Invalid date '{}', expected YYYY-MM-DD: {}", s, e))
}

/// The day before `today`, the most recent complete 00 UTC run.
pub fn default_reference_date(today: NaiveDate) -> NaiveDate {
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

impl Cli {
    pub fn selectors(&self) -> Vec<LevelSelector> {
        self.filter_levels
            .0
            .iter()
            .map(|kind| LevelSelector::for_kind(*kind, self.level))
            .collect()
    }

    /// Resolves the arguments and the loaded region file into a run config.
    pub fn to_pipeline_config(&self, region: &RegionConfig) -> Result<PipelineConfig, ConfigError> {
        let reference_date = self
            .reference_date
            .unwrap_or_else(|| default_reference_date(Local::now().date_naive()));

        let config = PipelineConfig {
            download_dir: self.temp_dir.join(&self.download_path),
            step_dir: self
                .temp_dir
                .join(&self.prepped_path)
                .join(&self.prepped_suffix),
            publish_dir: self.prepped_path.clone(),
            selectors: self.selectors(),
            number_of_days: self.number_of_days,
            step: self.step_counter,
            destination: self.push_destination,
            push_data_path: self.push_data_path.clone(),
            output_format: self.output_format,
            delete_remote_first: self.delete_s3_files_flag,
            reference_date,
            source_url: self.source_url.clone(),
            kelvin_offset: KELVIN_OFFSET,
            bounds: region.bounds()?,
            s3: region.s3.clone(),
        };

        config.validate(&self.yaml_file.display().to_string())?;
        Ok(config)
    }

    /// Default `RUST_LOG` filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}
