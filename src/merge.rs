//! # Variable Merging
//!
//! Turns one forecast file into a merged step table: every configured level
//! kind is decoded, the level tables are inner-joined on
//! (latitude, longitude) plus the pressure level when isobaric data is
//! selected, 2 m temperature is converted to Celsius, and the rows are
//! restricted to the region bounding box.
//!
//! Failures carry the step they happened in (`filter levels`,
//! `combine data`, `filter for lats`) so the driver can report where a file
//! broke.

use log::{debug, error};
use polars::prelude::*;
use std::fmt;
use thiserror::Error;

use crate::extract::{DecodeError, LevelDecoder, LevelSelector};
use crate::filters::{BoundingBox, BoundingBoxFilter};
use crate::forecast::RawForecastFile;
use crate::postprocess::{PostProcessError, ProcessingPipeline, UnitConverter};

pub const JOIN_KEYS: [&str; 2] = ["latitude", "longitude"];
/// Pressure level column of isobaric tables; one row per (point, level).
pub const LEVEL_COLUMN: &str = "isobaricInhPa";
/// Columns joined on whenever both level tables carry them.
const ROW_KEYS: [&str; 4] = ["latitude", "longitude", LEVEL_COLUMN, "time"];
pub const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    FilterLevels,
    CombineData,
    FilterForLats,
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeStep::FilterLevels => "filter levels",
            MergeStep::CombineData => "combine data",
            MergeStep::FilterForLats => "filter for lats",
        })
    }
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("no filter levels configured")]
    NoLevels,

    #[error("step '{step}': {source}")]
    Decode {
        step: MergeStep,
        #[source]
        source: DecodeError,
    },

    #[error("step '{step}': {source}")]
    Table {
        step: MergeStep,
        #[source]
        source: PostProcessError,
    },
}

impl MergeError {
    pub fn step(&self) -> MergeStep {
        match self {
            MergeError::NoLevels => MergeStep::FilterLevels,
            MergeError::Decode { step, .. } | MergeError::Table { step, .. } => *step,
        }
    }

    fn table(step: MergeStep) -> impl FnOnce(PostProcessError) -> MergeError {
        move |source| MergeError::Table { step, source }
    }

    fn polars(step: MergeStep) -> impl FnOnce(PolarsError) -> MergeError {
        move |e| MergeError::Table {
            step,
            source: PostProcessError::from(e),
        }
    }
}

/// Parameters shared by every file of a run.
#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub selectors: Vec<LevelSelector>,
    pub kelvin_offset: f64,
    pub bounds: BoundingBox,
}

/// Decodes, joins, converts and filters one forecast file.
pub fn merge_step_table(
    decoder: &dyn LevelDecoder,
    file: &RawForecastFile,
    settings: &MergeSettings,
) -> Result<DataFrame, MergeError> {
    let result = run_steps(decoder, file, settings);
    if let Err(e) = &result {
        error!(
            "Error processing {} at step '{}': {}",
            file.path.display(),
            e.step(),
            e
        );
    }
    result
}

fn run_steps(
    decoder: &dyn LevelDecoder,
    file: &RawForecastFile,
    settings: &MergeSettings,
) -> Result<DataFrame, MergeError> {
    if settings.selectors.is_empty() {
        return Err(MergeError::NoLevels);
    }

    let mut tables = Vec::with_capacity(settings.selectors.len());
    for selector in &settings.selectors {
        let df = decoder
            .decode(file, selector)
            .map_err(|source| MergeError::Decode {
                step: MergeStep::FilterLevels,
                source,
            })?;
        debug!("Level {} table shape: {:?}", selector.kind, df.shape());
        tables.push(df);
    }

    let step = MergeStep::CombineData;
    let joined = join_on_grid(tables).map_err(MergeError::polars(step))?;
    let mut convert = ProcessingPipeline::with_name(step.to_string());
    convert.add_processor(Box::new(UnitConverter::kelvin_to_celsius(
        "t2m",
        "t2m_cel",
        settings.kelvin_offset,
    )));
    let converted = convert.execute(joined).map_err(MergeError::table(step))?;

    let step = MergeStep::FilterForLats;
    let mut filter = ProcessingPipeline::with_name(step.to_string());
    filter.add_processor(Box::new(BoundingBoxFilter::new(settings.bounds)));
    let filtered = filter.execute(converted).map_err(MergeError::table(step))?;

    debug!(
        "Merged {} into {} rows",
        file.path.display(),
        filtered.height()
    );
    Ok(filtered)
}

/// Inner-joins all tables on the grid point, dropping rows with a null
/// coordinate, and sorts the result by point and pressure level.
///
/// Besides (latitude, longitude), any of `time` and `isobaricInhPa` present
/// on both sides of a join is part of its key. Pressure levels therefore stay
/// one row per (point, level) and `time` is not duplicated.
pub fn join_on_grid(tables: Vec<DataFrame>) -> PolarsResult<DataFrame> {
    let not_null = col("latitude")
        .is_not_null()
        .and(col("longitude").is_not_null());

    let mut tables = tables.into_iter();
    let Some(first) = tables.next() else {
        return Ok(DataFrame::empty());
    };

    let mut columns = column_names(&first);
    let mut joined = first.lazy().filter(not_null.clone());
    for right in tables {
        let right_columns = column_names(&right);
        let key_names: Vec<&str> = ROW_KEYS
            .into_iter()
            .filter(|k| has_column(&columns, k) && has_column(&right_columns, k))
            .collect();
        debug!("Joining level table on {:?}", key_names);
        let keys: Vec<Expr> = key_names.into_iter().map(col).collect();

        for name in right_columns {
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
        joined = joined.join(
            right.lazy().filter(not_null.clone()),
            keys.clone(),
            keys,
            JoinArgs::new(JoinType::Inner),
        );
    }

    let mut order: Vec<Expr> = JOIN_KEYS.iter().map(|k| col(*k)).collect();
    if has_column(&columns, LEVEL_COLUMN) {
        order.push(col(LEVEL_COLUMN));
    }
    joined
        .sort_by_exprs(order, SortMultipleOptions::default())
        .collect()
}

fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

fn has_column(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c == name)
}
