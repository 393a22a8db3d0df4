//! # GRIB2 Level Extraction Module
//!
//! Decodes the records of one vertical level kind from a GRIB2 forecast file
//! into a flat grid-point table. Each matching record contributes one
//! variable column; rows are grid points (repeated per level value when a
//! kind carries several levels, as isobaric data does).
//!
//! ## Column Allow-Lists
//!
//! | Level kind          | Columns                                                |
//! |---------------------|--------------------------------------------------------|
//! | `surface`           | longitude, latitude, surface, tp, tprate               |
//! | `heightAboveGround` | longitude, latitude, time, t2m                         |
//! | `isobaricInhPa`     | longitude, latitude, time, isobaricInhPa, t            |
//!
//! Allow-listed variables absent from a file are left out of the table;
//! downstream stages report the missing column by name.

use chrono::NaiveDate;
use log::{debug, warn};
use polars::prelude::*;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::forecast::RawForecastFile;

/// Errors raised while decoding a GRIB2 file
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read GRIB2 data from {}: {message}", .path.display())]
    Grib { path: PathBuf, message: String },

    #[error("no {kind} records in {}", .path.display())]
    NoMatchingRecords { path: PathBuf, kind: LevelKind },

    #[error("record '{name}' has {found} values but the grid has {expected} points")]
    GridMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("table construction failed: {0}")]
    Polars(#[from] PolarsError),
}

/// Vertical reference of a GRIB2 record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LevelKind {
    Surface,
    HeightAboveGround,
    IsobaricInhPa,
}

impl LevelKind {
    /// GRIB2 code table 4.5 type of the first fixed surface.
    pub fn surface_type(&self) -> u8 {
        match self {
            LevelKind::Surface => 1,
            LevelKind::HeightAboveGround => 103,
            LevelKind::IsobaricInhPa => 100,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LevelKind::Surface => "surface",
            LevelKind::HeightAboveGround => "heightAboveGround",
            LevelKind::IsobaricInhPa => "isobaricInhPa",
        }
    }

    /// Columns kept for this kind, in output order.
    pub fn allowed_columns(&self) -> &'static [&'static str] {
        match self {
            LevelKind::Surface => &["longitude", "latitude", "surface", "tp", "tprate"],
            LevelKind::HeightAboveGround => &["longitude", "latitude", "time", "t2m"],
            LevelKind::IsobaricInhPa => &["longitude", "latitude", "time", "isobaricInhPa", "t"],
        }
    }

    /// Converts a raw fixed-surface value to this kind's level unit.
    pub fn level_value(&self, raw: f64) -> f64 {
        match self {
            // Pa -> hPa
            LevelKind::IsobaricInhPa => raw / 100.0,
            _ => raw,
        }
    }

    /// Short name of a parameter at this kind, following ecCodes naming.
    pub fn short_name(&self, discipline: u8, category: u8, number: u8) -> Option<&'static str> {
        match (discipline, category, number, self) {
            (0, 0, 0, LevelKind::HeightAboveGround) => Some("t2m"),
            (0, 0, 0, _) => Some("t"),
            (0, 1, 8, _) | (0, 1, 193, _) => Some("tp"),
            (0, 1, 7, _) | (0, 1, 52, _) => Some("tprate"),
            _ => None,
        }
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LevelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "surface" => Ok(LevelKind::Surface),
            "heightAboveGround" => Ok(LevelKind::HeightAboveGround),
            "isobaricInhPa" => Ok(LevelKind::IsobaricInhPa),
            other => Err(format!(
                "unknown level kind '{}', expected surface, heightAboveGround or isobaricInhPa",
                other
            )),
        }
    }
}

/// Selects the records of one level kind, optionally at a single level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelSelector {
    pub kind: LevelKind,
    pub level: Option<u32>,
}

impl LevelSelector {
    /// Applies `level` only where a kind is conventionally pinned to one
    /// level (2 m temperature).
    pub fn for_kind(kind: LevelKind, level: u32) -> Self {
        let level = match kind {
            LevelKind::HeightAboveGround => Some(level),
            _ => None,
        };
        Self { kind, level }
    }

    pub fn matches(&self, surface_type: u8, level: f64) -> bool {
        if surface_type != self.kind.surface_type() {
            return false;
        }
        match self.level {
            Some(wanted) => (self.kind.level_value(level) - f64::from(wanted)).abs() < 1e-6,
            None => true,
        }
    }
}

/// Grid coordinates shared by every record of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
}

impl Grid {
    pub fn len(&self) -> usize {
        self.latitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitudes.is_empty()
    }
}

/// One decoded GRIB2 field.
#[derive(Debug, Clone, PartialEq)]
pub struct GribRecord {
    pub name: String,
    /// Level in the selector kind's unit.
    pub level: f64,
    /// Missing points are `None`.
    pub values: Vec<Option<f64>>,
}

/// Decodes one level kind of a forecast file into a table.
pub trait LevelDecoder: Send + Sync {
    fn decode(
        &self,
        file: &RawForecastFile,
        selector: &LevelSelector,
    ) -> Result<DataFrame, DecodeError>;
}

/// [`LevelDecoder`] backed by the `grib` crate.
#[derive(Debug, Clone, Default)]
pub struct GribLevelDecoder;

impl LevelDecoder for GribLevelDecoder {
    fn decode(
        &self,
        file: &RawForecastFile,
        selector: &LevelSelector,
    ) -> Result<DataFrame, DecodeError> {
        let (grid, records) = read_records(&file.path, selector)?;
        if records.is_empty() {
            return Err(DecodeError::NoMatchingRecords {
                path: file.path.clone(),
                kind: selector.kind,
            });
        }
        records_to_table(&grid, &records, selector, file.request.reference_date)
    }
}

fn grib_error(path: &Path, e: impl fmt::Display) -> DecodeError {
    DecodeError::Grib {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Reads every record matching `selector`, with the grid of the first match.
pub fn read_records(
    path: &Path,
    selector: &LevelSelector,
) -> Result<(Grid, Vec<GribRecord>), DecodeError> {
    let f = File::open(path).map_err(|source| DecodeError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let grib2 = grib::from_reader(BufReader::new(f)).map_err(|e| grib_error(path, e))?;

    let mut grid: Option<Grid> = None;
    let mut records = Vec::new();

    for (_index, submsg) in grib2.iter() {
        let Some((first, _second)) = submsg.prod_def().fixed_surfaces() else {
            continue;
        };
        let raw_level = first.value();
        if !selector.matches(first.surface_type, raw_level) {
            continue;
        }

        let discipline = submsg.indicator().discipline;
        let (Some(category), Some(number)) = (
            submsg.prod_def().parameter_category(),
            submsg.prod_def().parameter_number(),
        ) else {
            continue;
        };
        let Some(name) = selector.kind.short_name(discipline, category, number) else {
            debug!(
                "Skipping parameter {}/{}/{} at {}",
                discipline, category, number, selector.kind
            );
            continue;
        };

        if grid.is_none() {
            let latlons: Vec<(f32, f32)> = submsg
                .latlons()
                .map_err(|e| grib_error(path, e))?
                .collect();
            grid = Some(Grid {
                latitudes: latlons.iter().map(|(lat, _)| f64::from(*lat)).collect(),
                longitudes: latlons
                    .iter()
                    .map(|(_, lon)| normalize_longitude(f64::from(*lon)))
                    .collect(),
            });
        }

        let decoder = grib::Grib2SubmessageDecoder::from(submsg).map_err(|e| grib_error(path, e))?;
        let values: Vec<Option<f64>> = decoder
            .dispatch()
            .map_err(|e| grib_error(path, e))?
            .map(|v| if v.is_nan() { None } else { Some(f64::from(v)) })
            .collect();

        debug!(
            "Decoded '{}' at {} {} ({} points)",
            name,
            selector.kind,
            selector.kind.level_value(raw_level),
            values.len()
        );
        records.push(GribRecord {
            name: name.to_string(),
            level: selector.kind.level_value(raw_level),
            values,
        });
    }

    let grid = grid.unwrap_or(Grid {
        latitudes: Vec::new(),
        longitudes: Vec::new(),
    });
    Ok((grid, records))
}

/// Wraps longitudes into `[-180, 180)`.
pub fn normalize_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Builds the level table from decoded records.
///
/// One row per (level, grid point). Only allow-listed columns are emitted;
/// `time` carries the forecast reference date.
pub fn records_to_table(
    grid: &Grid,
    records: &[GribRecord],
    selector: &LevelSelector,
    reference_date: NaiveDate,
) -> Result<DataFrame, DecodeError> {
    for record in records {
        if record.values.len() != grid.len() {
            return Err(DecodeError::GridMismatch {
                name: record.name.clone(),
                expected: grid.len(),
                found: record.values.len(),
            });
        }
    }

    let mut levels: Vec<f64> = Vec::new();
    for record in records {
        if !levels.iter().any(|l| (l - record.level).abs() < 1e-9) {
            levels.push(record.level);
        }
    }
    levels.sort_by(|a, b| a.total_cmp(b));

    let points = grid.len();
    let rows = points * levels.len();
    let date = reference_date.format("%Y-%m-%d").to_string();
    let kind = selector.kind;

    let mut columns: Vec<Column> = Vec::new();
    for name in kind.allowed_columns() {
        let column: Option<Column> = match *name {
            "longitude" => Some(repeat_grid(&grid.longitudes, levels.len(), name)),
            "latitude" => Some(repeat_grid(&grid.latitudes, levels.len(), name)),
            "time" => Some(Series::new((*name).into(), vec![date.clone(); rows]).into()),
            "surface" | "isobaricInhPa" => {
                let values: Vec<f64> = levels
                    .iter()
                    .flat_map(|l| std::iter::repeat_n(*l, points))
                    .collect();
                Some(Series::new((*name).into(), values).into())
            }
            variable => variable_column(records, &levels, points, variable),
        };

        match column {
            Some(c) => columns.push(c),
            None => warn!("Variable '{}' not found at {} level", name, kind),
        }
    }

    Ok(DataFrame::new(columns)?)
}

fn repeat_grid(coords: &[f64], times: usize, name: &str) -> Column {
    let values: Vec<f64> = (0..times).flat_map(|_| coords.iter().copied()).collect();
    Series::new(name.into(), values).into()
}

fn variable_column(
    records: &[GribRecord],
    levels: &[f64],
    points: usize,
    name: &str,
) -> Option<Column> {
    let matching: Vec<&GribRecord> = records.iter().filter(|r| r.name == name).collect();
    if matching.is_empty() {
        return None;
    }

    let mut values: Vec<Option<f64>> = Vec::with_capacity(points * levels.len());
    for level in levels {
        match matching.iter().find(|r| (r.level - level).abs() < 1e-9) {
            Some(record) => values.extend(record.values.iter().copied()),
            None => values.extend(std::iter::repeat_n(None, points)),
        }
    }
    Some(Series::new(name.into(), values).into())
}
