//! # Geographic Filtering Module
//!
//! Converts the degree-minute-second region edges from the configuration
//! file into a decimal bounding box, and provides a post-processor that
//! restricts a grid-point table to that box.
//!
//! ## DMS Parsing
//!
//! Digit runs are extracted in order from the coordinate string:
//!
//! - **2 numbers**: degrees and minutes
//! - **3 numbers**: degrees, minutes and seconds
//! - **any other count**: the first two are used as degrees and minutes
//!
//! A standalone `S`/`W` letter or `South`/`West` word (any case) negates
//! the result. Strings without a direction are taken as positive
//! (north/east).
//!
//! ## Example
//!
//! ```rust
//! use grib2csv::filters::dms_to_decimal;
//!
//! let lat = dms_to_decimal("27° 30' N").unwrap();
//! assert_eq!(lat, 27.5);
//! ```

use log::{debug, error};
use polars::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

use crate::postprocess::{PostProcessResult, PostProcessor};

static DIGIT_RUNS: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(r"\d+"));
static LETTER_RUNS: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+"));

/// Errors raised while resolving the region bounding box
#[derive(Error, Debug, PartialEq)]
pub enum GeoError {
    #[error("coordinate '{key}' could not be parsed from '{value}'")]
    InvalidDms { key: String, value: String },

    #[error("coordinate '{0}' has no entry in coords_map")]
    UnmappedKey(String),

    #[error("bounding box is missing its {0} edge")]
    MissingEdge(&'static str),

    #[error("bounding box {axis} range is inverted: {min} > {max}")]
    InvertedRange { axis: &'static str, min: f64, max: f64 },
}

/// Inclusive latitude/longitude rectangle in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Result<Self, GeoError> {
        if min_lat > max_lat {
            return Err(GeoError::InvertedRange {
                axis: "latitude",
                min: min_lat,
                max: max_lat,
            });
        }
        if min_lon > max_lon {
            return Err(GeoError::InvertedRange {
                axis: "longitude",
                min: min_lon,
                max: max_lon,
            });
        }
        Ok(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    /// Inclusive on every edge.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Polars predicate equivalent to [`BoundingBox::contains`].
    pub fn predicate(&self) -> Expr {
        col("latitude")
            .gt_eq(lit(self.min_lat))
            .and(col("latitude").lt_eq(lit(self.max_lat)))
            .and(col("longitude").gt_eq(lit(self.min_lon)))
            .and(col("longitude").lt_eq(lit(self.max_lon)))
    }
}

/// Decimal degrees from a DMS string, or `None` when fewer than two digit
/// runs are present.
pub fn dms_to_decimal(coord: &str) -> Option<f64> {
    let digits = DIGIT_RUNS.as_ref().ok()?;
    let numbers: Vec<f64> = digits
        .find_iter(coord)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();

    let magnitude = match numbers.as_slice() {
        [deg, min, sec] => deg + min / 60.0 + sec / 3600.0,
        [deg, min, ..] => deg + min / 60.0,
        _ => return None,
    };

    Some(match direction_of(coord) {
        Some('S') | Some('W') => -magnitude,
        _ => magnitude,
    })
}

/// Last standalone compass letter or word (`S`, `south`, ...) in `coord`.
fn direction_of(coord: &str) -> Option<char> {
    let words = LETTER_RUNS.as_ref().ok()?;
    words
        .find_iter(coord)
        .filter_map(|m| match m.as_str().to_ascii_uppercase().as_str() {
            "N" | "NORTH" => Some('N'),
            "S" | "SOUTH" => Some('S'),
            "E" | "EAST" => Some('E'),
            "W" | "WEST" => Some('W'),
            _ => None,
        })
        .last()
}

/// Converts every entry of `coords` and renames it through `coords_map`.
///
/// All-or-nothing: a single unparseable or unmapped entry fails the set.
pub fn coords_as_decimal(
    coords: &BTreeMap<String, String>,
    coords_map: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, f64>, GeoError> {
    let mut decimal = BTreeMap::new();

    for (key, value) in coords {
        let output_key = coords_map
            .get(key)
            .ok_or_else(|| GeoError::UnmappedKey(key.clone()))?;
        let degrees = dms_to_decimal(value).ok_or_else(|| GeoError::InvalidDms {
            key: key.clone(),
            value: value.clone(),
        })?;
        debug!("Coordinate {} ({}) = {} -> {:.6}", key, output_key, value, degrees);
        decimal.insert(output_key.clone(), degrees);
    }

    Ok(decimal)
}

/// Resolves the region bounding box from the DMS edges.
///
/// `coords` is keyed by edge (`north`, `south`, `east`, `west`); `coords_map`
/// names the output key for each edge. Errors are logged before returning.
pub fn region_bounds(
    coords: &BTreeMap<String, String>,
    coords_map: &BTreeMap<String, String>,
) -> Result<BoundingBox, GeoError> {
    resolve_bounds(coords, coords_map).inspect_err(|e| error!("Failed to resolve region bounds: {}", e))
}

fn resolve_bounds(
    coords: &BTreeMap<String, String>,
    coords_map: &BTreeMap<String, String>,
) -> Result<BoundingBox, GeoError> {
    let decimal = coords_as_decimal(coords, coords_map)?;

    let edge = |name: &'static str| -> Result<f64, GeoError> {
        coords_map
            .get(name)
            .and_then(|output_key| decimal.get(output_key))
            .copied()
            .ok_or(GeoError::MissingEdge(name))
    };

    BoundingBox::new(edge("south")?, edge("north")?, edge("west")?, edge("east")?)
}

/// Keeps only rows whose (latitude, longitude) lies inside the box.
pub struct BoundingBoxFilter {
    bounds: BoundingBox,
}

impl BoundingBoxFilter {
    pub fn new(bounds: BoundingBox) -> Self {
        Self { bounds }
    }
}

impl PostProcessor for BoundingBoxFilter {
    fn process(&self, df: DataFrame) -> PostProcessResult<DataFrame> {
        debug!(
            "Filtering to lat [{}, {}] lon [{}, {}]",
            self.bounds.min_lat, self.bounds.max_lat, self.bounds.min_lon, self.bounds.max_lon
        );
        Ok(df.lazy().filter(self.bounds.predicate()).collect()?)
    }

    fn name(&self) -> &str {
        "BoundingBoxFilter"
    }

    fn description(&self) -> &str {
        "Keeps grid points inside the region bounding box"
    }

    fn required_columns(&self) -> Vec<String> {
        vec!["latitude".to_string(), "longitude".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn bhutan() -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let coords = map(&[
            ("north", "28° 15' N"),
            ("south", "26° 42' N"),
            ("east", "92° 07' E"),
            ("west", "88° 45' E"),
        ]);
        let coords_map = map(&[
            ("north", "max_lat_bhutan"),
            ("south", "min_lat_bhutan"),
            ("east", "max_lon_bhutan"),
            ("west", "min_lon_bhutan"),
        ]);
        (coords, coords_map)
    }

    #[test]
    fn test_two_components() {
        assert_eq!(dms_to_decimal("27° 30'"), Some(27.5));
        assert_eq!(dms_to_decimal("89 45"), Some(89.75));
    }

    #[test]
    fn test_three_components() {
        let value = dms_to_decimal("27° 30' 36\"").unwrap();
        assert!((value - (27.0 + 30.0 / 60.0 + 36.0 / 3600.0)).abs() < 1e-12);
    }

    #[test]
    fn test_other_counts_fall_back_to_degrees_minutes() {
        assert_eq!(dms_to_decimal("10 30 0 99"), Some(10.5));
        assert_eq!(dms_to_decimal("27"), None);
        assert_eq!(dms_to_decimal("north"), None);
    }

    #[test]
    fn test_direction_letter() {
        assert_eq!(dms_to_decimal("33° 30' S"), Some(-33.5));
        assert_eq!(dms_to_decimal("70° 15'W"), Some(-70.25));
        assert_eq!(dms_to_decimal("33° 30' N"), Some(33.5));
        assert_eq!(dms_to_decimal("70° 15' E"), Some(70.25));
        assert_eq!(dms_to_decimal("s 33 30"), Some(-33.5));
    }

    #[test]
    fn test_dms_direction_words() {
        assert_eq!(dms_to_decimal("33 30 South"), Some(-33.5));
        assert_eq!(dms_to_decimal("West 70 15"), Some(-70.25));
        assert_eq!(dms_to_decimal("27 42 north"), Some(27.7));
        assert_eq!(dms_to_decimal("92°7' EAST"), Some(92.0 + 7.0 / 60.0));
        // letters inside other words are not directions
        assert_eq!(dms_to_decimal("33 30 Swest"), Some(33.5));
        assert_eq!(dms_to_decimal("33 30 deg S"), Some(-33.5));
    }

    #[test]
    fn test_region_bounds() {
        let (coords, coords_map) = bhutan();
        let bounds = region_bounds(&coords, &coords_map).unwrap();
        assert!((bounds.min_lat - 26.7).abs() < 1e-12);
        assert_eq!(bounds.max_lat, 28.25);
        assert!((bounds.min_lon - 88.75).abs() < 1e-12);
        assert!((bounds.max_lon - (92.0 + 7.0 / 60.0)).abs() < 1e-12);
    }

    #[test]
    fn test_coords_as_decimal_uses_output_keys() {
        let (coords, coords_map) = bhutan();
        let decimal = coords_as_decimal(&coords, &coords_map).unwrap();
        assert_eq!(decimal.len(), 4);
        assert_eq!(decimal.get("max_lat_bhutan"), Some(&28.25));
        assert!(!decimal.contains_key("north"));
    }

    #[test]
    fn test_all_or_nothing() {
        let (mut coords, coords_map) = bhutan();
        coords.insert("east".to_string(), "garbage".to_string());
        assert!(matches!(
            coords_as_decimal(&coords, &coords_map),
            Err(GeoError::InvalidDms { .. })
        ));

        let (coords, mut coords_map) = bhutan();
        coords_map.remove("west");
        assert_eq!(
            region_bounds(&coords, &coords_map),
            Err(GeoError::UnmappedKey("west".to_string()))
        );

        let (mut coords, coords_map) = bhutan();
        coords.remove("south");
        assert_eq!(
            region_bounds(&coords, &coords_map),
            Err(GeoError::MissingEdge("south"))
        );
    }

    #[test]
    fn test_inverted_range_rejected() {
        let (mut coords, coords_map) = bhutan();
        coords.insert("south".to_string(), "29 00".to_string());
        assert!(matches!(
            region_bounds(&coords, &coords_map),
            Err(GeoError::InvertedRange { axis: "latitude", .. })
        ));
    }

    #[test]
    fn test_contains_is_inclusive() {
        let bounds = BoundingBox::new(10.0, 20.0, 30.0, 40.0).unwrap();
        assert!(bounds.contains(10.0, 30.0));
        assert!(bounds.contains(20.0, 40.0));
        assert!(!bounds.contains(20.0001, 35.0));
        assert!(!bounds.contains(15.0, 29.9));
    }

    #[test]
    fn test_bounding_box_filter() {
        let df = df! {
            "latitude" => [10.0, 15.0, 20.0, 25.0],
            "longitude" => [30.0, 35.0, 40.0, 35.0],
            "t2m" => [280.0, 281.0, 282.0, 283.0],
        }
        .unwrap();

        let bounds = BoundingBox::new(10.0, 20.0, 30.0, 40.0).unwrap();
        let filtered = BoundingBoxFilter::new(bounds).process(df).unwrap();
        assert_eq!(filtered.height(), 3);

        let lats = filtered.column("latitude").unwrap().f64().unwrap();
        let lons = filtered.column("longitude").unwrap().f64().unwrap();
        for (lat, lon) in lats.into_iter().zip(lons.into_iter()) {
            assert!(bounds.contains(lat.unwrap(), lon.unwrap()));
        }
    }
}
