//! # Forecast Request Module
//!
//! Identity of a single upstream forecast file and the deterministic names
//! derived from it. Every stage of the pipeline locates its inputs through
//! these helpers, so the download, decode, and combine stages agree on
//! filenames without passing paths around.
//!
//! ## Naming
//!
//! - GRIB file: `ecmwf_data_{YYYYMMDD}000000_{step}h_oper_fc.grib2`
//! - Per-step table: `ecmwf_data_{YYYYMMDD}000000_{step}h_oper_fc.csv`
//! - Day output: `ecmwf_data_{YYYYMMDD}000000_{h1}{h2}...h_oper_fc_{day}.{ext}`

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Forecast stream. Only the operational high-resolution run is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stream {
    Operational,
}

impl Stream {
    pub fn code(&self) -> &'static str {
        match self {
            Stream::Operational => "oper",
        }
    }
}

/// Product type within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProductType {
    Forecast,
}

impl ProductType {
    pub fn code(&self) -> &'static str {
        match self {
            ProductType::Forecast => "fc",
        }
    }
}

/// Identifies exactly one upstream forecast file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForecastRequest {
    pub reference_date: NaiveDate,
    /// Hours from the 00 UTC reference time.
    pub step: u32,
    pub stream: Stream,
    pub product: ProductType,
}

impl ForecastRequest {
    /// Operational forecast for the 00 UTC run of `reference_date`.
    pub fn new(reference_date: NaiveDate, step: u32) -> Self {
        Self {
            reference_date,
            step,
            stream: Stream::Operational,
            product: ProductType::Forecast,
        }
    }

    /// Reference run hour. The pipeline only consumes the 00 UTC run.
    pub fn run_hour(&self) -> u32 {
        0
    }

    /// Shared stem of the GRIB file and its per-step table.
    pub fn file_stem(&self) -> String {
        format!(
            "ecmwf_data_{}000000_{}h_{}_{}",
            date_token(self.reference_date),
            self.step,
            self.stream.code(),
            self.product.code()
        )
    }

    pub fn grib_file_name(&self) -> String {
        format!("{}.grib2", self.file_stem())
    }

    pub fn step_table_name(&self) -> String {
        format!("{}.csv", self.file_stem())
    }

    pub fn grib_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(self.grib_file_name())
    }

    pub fn step_table_path(&self, prepped_dir: &Path) -> PathBuf {
        prepped_dir.join(self.step_table_name())
    }

    /// Path of the file below the open-data root, e.g.
    /// `20240101/00z/ifs/0p25/oper/20240101000000-6h-oper-fc.grib2`.
    pub fn remote_path(&self) -> String {
        let date = date_token(self.reference_date);
        let hour = self.run_hour();
        format!(
            "{date}/{hour:02}z/ifs/0p25/{stream}/{date}{hour:02}0000-{step}h-{stream}-{product}.grib2",
            stream = self.stream.code(),
            step = self.step,
            product = self.product.code(),
        )
    }
}

impl fmt::Display for ForecastRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}z +{}h ({}/{})",
            self.reference_date,
            self.run_hour(),
            self.step,
            self.stream.code(),
            self.product.code()
        )
    }
}

/// A forecast file present on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawForecastFile {
    pub path: PathBuf,
    pub request: ForecastRequest,
}

/// `YYYYMMDD` rendering used in every file and object name.
pub fn date_token(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
