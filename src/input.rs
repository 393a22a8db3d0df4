//! # Input Configuration Module
//!
//! This module provides configuration parsing and validation for grib2csv runs.
//! It handles the region configuration file (YAML, or JSON by extension) and
//! the fully resolved [`PipelineConfig`] the driver works from.
//!
//! ## Configuration Structure
//!
//! A region configuration file specifies:
//! - **coords**: The region edges (`north`, `south`, `east`, `west`) as
//!   degree-minute-second strings
//! - **coords_map**: Output key for each edge, e.g. `north: max_lat_region`
//! - **s3**: Optional bucket settings, required when publishing to S3
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use grib2csv::input::RegionConfig;
//!
//! // Load from file
//! let config = RegionConfig::from_file("gribcfg.yaml")?;
//!
//! // Load from a YAML string
//! let yaml = r#"
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
//! "#;
//! let config = RegionConfig::from_yaml(yaml)?;
//! let bounds = config.bounds()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use chrono::NaiveDate;
use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::extract::{LevelKind, LevelSelector};
use crate::filters::{BoundingBox, GeoError, region_bounds};
use crate::output::OutputFormat;
use crate::schedule::{DayChunk, ScheduleError, plan_chunks};

/// Default root of the ECMWF open-data mirror.
pub const DEFAULT_SOURCE_URL: &str = "https://data.ecmwf.int/forecasts";

/// Errors raised while loading or validating run configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid region: {0}")]
    Region(#[from] GeoError),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("no filter levels given")]
    NoLevels,

    #[error("an 's3' block is required in {0} to publish to S3")]
    MissingS3Settings(String),
}

/// Region definition loaded from the configuration file.
///
/// # Examples
///
/// ```rust
/// use grib2csv::input::RegionConfig;
/// use std::collections::BTreeMap;
///
/// let config = RegionConfig {
///     coords: BTreeMap::from([
///         ("north".to_string(), "28 15 N".to_string()),
///         ("south".to_string(), "26 42 N".to_string()),
///         ("east".to_string(), "92 7 E".to_string()),
///         ("west".to_string(), "88 44 E".to_string()),
///     ]),
///     coords_map: BTreeMap::from([
///         ("north".to_string(), "max_lat".to_string()),
///         ("south".to_string(), "min_lat".to_string()),
///         ("east".to_string(), "max_lon".to_string()),
///         ("west".to_string(), "min_lon".to_string()),
///     ]),
///     s3: None,
/// };
/// assert!(config.bounds().is_ok());
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RegionConfig {
    /// Region edges as DMS strings, keyed by `north`, `south`, `east`, `west`
    pub coords: BTreeMap<String, String>,
    /// Output key for each edge
    pub coords_map: BTreeMap<String, String>,
    /// Bucket settings for S3 publishing
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

/// Bucket and credentials for the S3 destination.
///
/// The credential keys use the upper-case names found in existing
/// configuration files. When either is absent the default AWS provider chain
/// is used instead.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket_name: String,
    pub s3_region: String,
    #[serde(rename = "AWS_ACCESS_KEY_ID", default)]
    pub access_key_id: Option<String>,
    #[serde(rename = "AWS_SECRET_ACCESS_KEY", default)]
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket_name", &self.bucket_name)
            .field("s3_region", &self.s3_region)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "***"))
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl RegionConfig {
    /// Loads a configuration from a file.
    ///
    /// Files ending in `.json` are parsed as JSON; everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not match the
    /// expected structure.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        debug!("Loading region configuration from {}", path.display());
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json_str)?)
    }

    /// Decimal bounding box of the region.
    pub fn bounds(&self) -> Result<BoundingBox, ConfigError> {
        Ok(region_bounds(&self.coords, &self.coords_map)?)
    }
}

/// Where finished day tables are published.
#[derive(ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushDestination {
    /// Write into the prepped directory
    #[default]
    Local,
    /// Upload to the configured S3 bucket
    S3,
}

impl fmt::Display for PushDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PushDestination::Local => "local",
            PushDestination::S3 => "s3",
        })
    }
}

/// Parses a comma-separated level list such as `"surface, heightAboveGround"`.
pub fn parse_level_kinds(list: &str) -> Result<Vec<LevelKind>, String> {
    let kinds = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<LevelKind>, String>>()?;

    if kinds.is_empty() {
        return Err("at least one filter level is required".to_string());
    }
    Ok(kinds)
}

/// Fully resolved settings of one pipeline run.
///
/// The working directories are already joined onto the temp root, so
/// nothing below the driver reads process state. Only `publish_dir` stays
/// relative to the working directory.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// Where GRIB files are downloaded
    pub download_dir: PathBuf,
    /// Where per-step tables are staged; emptied after every day
    pub step_dir: PathBuf,
    /// Where day tables are written for the local destination
    pub publish_dir: PathBuf,
    /// Level kinds decoded from every file, in join order
    pub selectors: Vec<LevelSelector>,
    pub number_of_days: u32,
    /// Forecast step in hours
    pub step: u32,
    pub destination: PushDestination,
    /// Key prefix of published objects
    pub push_data_path: String,
    pub output_format: OutputFormat,
    /// Clear the publish prefix before the first day
    pub delete_remote_first: bool,
    /// Date of the 00 UTC run being fetched
    pub reference_date: NaiveDate,
    pub source_url: String,
    pub kelvin_offset: f64,
    pub bounds: BoundingBox,
    #[serde(skip)]
    pub s3: Option<S3Settings>,
}

impl PipelineConfig {
    /// Day chunks of this run.
    pub fn chunks(&self) -> Result<Vec<DayChunk>, ConfigError> {
        Ok(plan_chunks(self.number_of_days, self.step)?)
    }

    /// Whether the run needs an S3 client at all. The pre-run prefix
    /// delete only applies to the S3 destination.
    pub fn needs_s3(&self) -> bool {
        self.destination == PushDestination::S3
    }

    /// Whether the publish prefix is cleared before the first day.
    pub fn clears_remote_first(&self) -> bool {
        self.needs_s3() && self.delete_remote_first
    }

    /// Fails when the run needs an S3 client but no bucket is configured.
    pub fn validate(&self, config_name: &str) -> Result<(), ConfigError> {
        if self.selectors.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        self.chunks()?;
        if self.needs_s3() && self.s3.is_none() {
            return Err(ConfigError::MissingS3Settings(config_name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
coords:
  north: "28°15'N"
  south: "26°42'N"
  east: "92°7'E"
  west: "88°44'E"
coords_map:
  north: max_lat_region
  south: min_lat_region
  east: max_lon_region
  west: min_lon_region
s3:
  bucket_name: feed-bucket
  s3_region: ap-south-1
  AWS_ACCESS_KEY_ID: AKIDEXAMPLE
  AWS_SECRET_ACCESS_KEY: very-secret
"#;

    #[test]
    fn test_region_from_yaml() {
        let config = RegionConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.coords.len(), 4);
        assert_eq!(config.coords_map["north"], "max_lat_region");

        let s3 = config.s3.clone().unwrap();
        assert_eq!(s3.bucket_name, "feed-bucket");
        assert_eq!(s3.access_key_id.as_deref(), Some("AKIDEXAMPLE"));

        let bounds = config.bounds().unwrap();
        assert!((bounds.max_lat - 28.25).abs() < 1e-9);
        assert!((bounds.min_lat - 26.7).abs() < 1e-9);
        assert!((bounds.min_lon - (88.0 + 44.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = RegionConfig::from_yaml(YAML).unwrap();
        let rendered = format!("{:?}", config.s3.unwrap());
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("feed-bucket"));
    }

    #[test]
    fn test_region_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"coords": {{"north": "1 0 N", "south": "1 0 S", "east": "2 0 E", "west": "2 0 W"}},
                "coords_map": {{"north": "n", "south": "s", "east": "e", "west": "w"}}}}"#
        )
        .unwrap();

        let config = RegionConfig::from_file(file.path()).unwrap();
        assert!(config.s3.is_none());
        let bounds = config.bounds().unwrap();
        assert_eq!(bounds.min_lat, -1.0);
        assert_eq!(bounds.max_lon, 2.0);
    }

    #[test]
    fn test_missing_file() {
        let result = RegionConfig::from_file("/nonexistent/gribcfg.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_bad_dms_is_region_error() {
        let yaml = YAML.replace("28°15'N", "north-ish");
        let config = RegionConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(config.bounds(), Err(ConfigError::Region(_))));
    }

    #[test]
    fn test_parse_level_kinds() {
        assert_eq!(
            parse_level_kinds("surface, heightAboveGround").unwrap(),
            vec![LevelKind::Surface, LevelKind::HeightAboveGround]
        );
        assert_eq!(
            parse_level_kinds("isobaricInhPa").unwrap(),
            vec![LevelKind::IsobaricInhPa]
        );
        assert!(parse_level_kinds("surface, sea").is_err());
        assert!(parse_level_kinds(" , ").is_err());
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            download_dir: PathBuf::from("/tmp/download"),
            step_dir: PathBuf::from("/tmp/prepped/temp"),
            publish_dir: PathBuf::from("./prepped"),
            selectors: vec![LevelSelector::for_kind(LevelKind::Surface, 2)],
            number_of_days: 5,
            step: 6,
            destination: PushDestination::Local,
            push_data_path: String::new(),
            output_format: OutputFormat::Csv,
            delete_remote_first: false,
            reference_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            source_url: DEFAULT_SOURCE_URL.to_string(),
            kelvin_offset: 273.15,
            bounds: BoundingBox::new(26.0, 28.0, 88.0, 92.0).unwrap(),
            s3: None,
        }
    }

    #[test]
    fn test_pipeline_config_validation() {
        let config = pipeline_config();
        assert!(config.validate("gribcfg.yaml").is_ok());
        assert_eq!(config.chunks().unwrap().len(), 5);

        let mut local = pipeline_config();
        local.delete_remote_first = true;
        assert!(!local.needs_s3());
        assert!(!local.clears_remote_first());
        assert!(local.validate("gribcfg.yaml").is_ok());

        let mut s3 = pipeline_config();
        s3.destination = PushDestination::S3;
        s3.delete_remote_first = true;
        assert!(s3.clears_remote_first());
        assert!(matches!(
            s3.validate("gribcfg.yaml"),
            Err(ConfigError::MissingS3Settings(_))
        ));

        let mut bad_step = pipeline_config();
        bad_step.step = 0;
        assert!(matches!(
            bad_step.validate("gribcfg.yaml"),
            Err(ConfigError::Schedule(_))
        ));

        let mut no_levels = pipeline_config();
        no_levels.selectors.clear();
        assert!(matches!(
            no_levels.validate("gribcfg.yaml"),
            Err(ConfigError::NoLevels)
        ));
    }
}
