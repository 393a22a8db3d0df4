//! # Day Combination Module
//!
//! Pivots the merged step tables of one day chunk into a single long table
//! with one row per (grid point, variable) and one column per forecast
//! offset.
//!
//! Step values are aligned onto the first step's grid by an explicit
//! (latitude, longitude) join, so differing row orders between step files
//! cannot misplace values. A grid point missing from a later step yields a
//! null in that step's column. Steps with isobaric data also join on
//! `isobaricInhPa`, which then follows `param_tag` in the output.
//!
//! ## Output Layout
//!
//! ```text
//! longitude | latitude | forecast_date | param | param_tag | 6h | 12h | ...
//! ```

use chrono::NaiveDate;
use log::{debug, info};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::forecast::ForecastRequest;
use crate::merge::{JOIN_KEYS, LEVEL_COLUMN};
use crate::postprocess::{
    ColumnRenamer, ColumnReorderer, PostProcessError, PostProcessResult, PostProcessor,
    ProcessingPipeline,
};
use crate::schedule::{DayChunk, hour_label};

pub const LEADING_COLUMNS: [&str; 5] = ["longitude", "latitude", "forecast_date", "param", "param_tag"];

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("step {step}h table not found at {}", .path.display())]
    MissingStepFile { step: u32, path: PathBuf },

    #[error("failed to read step {step}h table {}: {source}", .path.display())]
    Read {
        step: u32,
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("step {step}h table has no '{column}' column")]
    MissingColumn { step: u32, column: String },

    #[error("chunk has no forecast steps")]
    EmptyChunk,

    #[error("failed to reshape day table: {0}")]
    Table(#[from] PostProcessError),
}

impl From<PolarsError> for CombineError {
    fn from(e: PolarsError) -> Self {
        CombineError::Table(PostProcessError::from(e))
    }
}

/// Variables carried into the day table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastVariable {
    TemperatureCelsius,
    Surface,
    Precipitation,
}

impl ForecastVariable {
    pub const ALL: [ForecastVariable; 3] = [
        ForecastVariable::TemperatureCelsius,
        ForecastVariable::Surface,
        ForecastVariable::Precipitation,
    ];

    /// Column in the merged step table, also used as `param_tag`.
    pub fn tag(&self) -> &'static str {
        match self {
            ForecastVariable::TemperatureCelsius => "t2m_cel",
            ForecastVariable::Surface => "surface",
            ForecastVariable::Precipitation => "tp",
        }
    }

    /// Human-readable `param` label.
    pub fn param(&self) -> &'static str {
        match self {
            ForecastVariable::TemperatureCelsius => "temperature_celcius",
            ForecastVariable::Surface => "surface_area",
            ForecastVariable::Precipitation => "precipitation",
        }
    }

    /// `param` for a tag; unknown tags are treated as precipitation.
    pub fn param_for_tag(tag: &str) -> &'static str {
        Self::ALL
            .iter()
            .find(|v| v.tag() == tag)
            .map(|v| v.param())
            .unwrap_or(ForecastVariable::Precipitation.param())
    }
}

/// Derives `param` from `param_tag`.
pub struct ParamLabeler;

impl PostProcessor for ParamLabeler {
    fn process(&self, df: DataFrame) -> PostProcessResult<DataFrame> {
        let label = when(col("param_tag").eq(lit(ForecastVariable::TemperatureCelsius.tag())))
            .then(lit(ForecastVariable::TemperatureCelsius.param()))
            .when(col("param_tag").eq(lit(ForecastVariable::Surface.tag())))
            .then(lit(ForecastVariable::Surface.param()))
            .otherwise(lit(ForecastVariable::Precipitation.param()))
            .alias("param");

        Ok(df.lazy().with_column(label).collect()?)
    }

    fn name(&self) -> &str {
        "ParamLabeler"
    }

    fn description(&self) -> &str {
        "Labels each row with the parameter name of its tag"
    }

    fn required_columns(&self) -> Vec<String> {
        vec!["param_tag".to_string()]
    }
}

/// Loads the chunk's step tables from `prepped_dir` and combines them.
pub fn combine_day(
    prepped_dir: &Path,
    reference_date: NaiveDate,
    chunk: &DayChunk,
) -> Result<DataFrame, CombineError> {
    let mut tables = Vec::with_capacity(chunk.offsets.len());
    for step in &chunk.offsets {
        let path = ForecastRequest::new(reference_date, *step).step_table_path(prepped_dir);
        tables.push((*step, read_step_table(*step, &path)?));
    }

    let combined = combine_tables(&tables)?;
    info!(
        "Combined day {} ({} steps) into {} rows",
        chunk.day,
        chunk.offsets.len(),
        combined.height()
    );
    Ok(combined)
}

fn read_step_table(step: u32, path: &Path) -> Result<DataFrame, CombineError> {
    if !path.exists() {
        return Err(CombineError::MissingStepFile {
            step,
            path: path.to_path_buf(),
        });
    }
    debug!("Reading step table {}", path.display());

    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|source| CombineError::Read {
            step,
            path: path.to_path_buf(),
            source,
        })
}

fn require(df: &DataFrame, step: u32, column: &str) -> Result<(), CombineError> {
    if df.get_column_names().iter().any(|c| c.as_str() == column) {
        Ok(())
    } else {
        Err(CombineError::MissingColumn {
            step,
            column: column.to_string(),
        })
    }
}

/// Combines `(step, merged table)` pairs, in step order, into the day table.
pub fn combine_tables(tables: &[(u32, DataFrame)]) -> Result<DataFrame, CombineError> {
    let Some((first_step, first)) = tables.first() else {
        return Err(CombineError::EmptyChunk);
    };
    for column in ["latitude", "longitude", "time"] {
        require(first, *first_step, column)?;
    }
    for (step, df) in tables {
        for variable in ForecastVariable::ALL {
            require(df, *step, variable.tag())?;
        }
    }

    // isobaric steps carry one row per (point, level)
    let mut key_names: Vec<&str> = JOIN_KEYS.to_vec();
    if first.get_column_names().iter().any(|c| c.as_str() == LEVEL_COLUMN) {
        for (step, df) in tables {
            require(df, *step, LEVEL_COLUMN)?;
        }
        key_names.push(LEVEL_COLUMN);
    }
    let keys: Vec<Expr> = key_names.iter().map(|k| col(*k)).collect();

    let mut reference_columns = keys.clone();
    reference_columns.push(col("time"));
    let reference = first.clone().lazy().select(reference_columns);

    let mut blocks = Vec::with_capacity(ForecastVariable::ALL.len());
    for variable in ForecastVariable::ALL {
        let mut block = reference
            .clone()
            .with_column(lit(variable.tag()).alias("param_tag"));

        for (step, df) in tables {
            let mut selection = keys.clone();
            selection.push(
                col(variable.tag())
                    .cast(DataType::Float64)
                    .alias(hour_label(*step).as_str()),
            );
            block = block.join(
                df.clone().lazy().select(selection),
                keys.clone(),
                keys.clone(),
                JoinArgs::new(JoinType::Left),
            );
        }

        blocks.push(block.sort_by_exprs(keys.clone(), SortMultipleOptions::default()));
    }

    let stacked = concat(blocks, UnionArgs::default())?.collect()?;

    let mut pipeline = ProcessingPipeline::with_name("day table".to_string());
    // the variable renames only apply when a step table is passed through unpivoted
    pipeline.add_processor(Box::new(ColumnRenamer::new([
        ("time", "forecast_date"),
        ("t2m_cel", "temperature"),
        ("tp", "precipitation"),
    ])));
    pipeline.add_processor(Box::new(ParamLabeler));
    pipeline.add_processor(Box::new(ColumnReorderer::new(&LEADING_COLUMNS)));

    Ok(pipeline.execute(stacked)?)
}
