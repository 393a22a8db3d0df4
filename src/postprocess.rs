//! # Post-Processing Framework
//!
//! Table transformations shared by the merge and combine stages. Each
//! transformation is a [`PostProcessor`]; a [`ProcessingPipeline`] chains
//! them and checks each processor's required columns before running it.
//!
//! ## Built-in Processors
//! - **ColumnRenamer**: Rename columns with ordered mappings
//! - **UnitConverter**: Offset conversion such as Kelvin to Celsius
//! - **ColumnReorderer**: Move a fixed prefix of columns to the front
//! - **BoundingBoxFilter** (in [`crate::filters`]): Keep rows inside a region
//!
//! ## Example
//! ```rust
//! use grib2csv::postprocess::{ProcessingPipeline, UnitConverter};
//! use polars::prelude::*;
//!
//! let mut pipeline = ProcessingPipeline::with_name("kelvin".to_string());
//! pipeline.add_processor(Box::new(UnitConverter::kelvin_to_celsius("t2m", "t2m_cel", 273.15)));
//!
//! let df = df! { "t2m" => [273.15, 283.15] }.unwrap();
//! let out = pipeline.execute(df).unwrap();
//! assert_eq!(out.width(), 2);
//! ```

use log::debug;
use polars::prelude::*;
use std::error::Error;
use std::fmt;

/// Result type for post-processing operations
pub type PostProcessResult<T> = Result<T, PostProcessError>;

/// Errors that can occur during post-processing
#[derive(Debug)]
pub enum PostProcessError {
    /// Column not found in DataFrame
    ColumnNotFound(String),
    /// Polars-specific error
    PolarsError(PolarsError),
}

impl fmt::Display for PostProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostProcessError::ColumnNotFound(col) => {
                write!(f, "Column '{}' not found in DataFrame", col)
            }
            PostProcessError::PolarsError(e) => write!(f, "Polars error: {}", e),
        }
    }
}

impl Error for PostProcessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PostProcessError::PolarsError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PolarsError> for PostProcessError {
    fn from(error: PolarsError) -> Self {
        PostProcessError::PolarsError(error)
    }
}

/// Core trait for post-processing operations on DataFrames
pub trait PostProcessor: Send + Sync {
    /// Process the DataFrame and return the transformed result
    fn process(&self, df: DataFrame) -> PostProcessResult<DataFrame>;

    /// Get the name/identifier of this processor
    fn name(&self) -> &str;

    /// Get a description of what this processor does
    fn description(&self) -> &str;

    /// Columns that must be present before this processor runs
    fn required_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Validate that the processor can operate on the given DataFrame schema
    fn validate_schema(&self, schema: &Schema) -> PostProcessResult<()> {
        for column in self.required_columns() {
            if !schema.contains(&column) {
                return Err(PostProcessError::ColumnNotFound(column));
            }
        }
        Ok(())
    }
}

/// Pipeline that chains multiple post-processors together
pub struct ProcessingPipeline {
    processors: Vec<Box<dyn PostProcessor>>,
    name: String,
}

impl ProcessingPipeline {
    /// Create a new empty processing pipeline
    pub fn new() -> Self {
        Self {
            name: "Unnamed Pipeline".to_string(),
            processors: Vec::new(),
        }
    }

    /// Create a new processing pipeline with a name
    pub fn with_name(name: String) -> Self {
        Self {
            name,
            processors: Vec::new(),
        }
    }

    /// Get the pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Add a processor to the pipeline
    pub fn add_processor(&mut self, processor: Box<dyn PostProcessor>) {
        self.processors.push(processor);
    }

    /// Execute the processing pipeline on a DataFrame
    pub fn execute(&self, mut df: DataFrame) -> PostProcessResult<DataFrame> {
        debug!(
            "Executing pipeline '{}' with {} processors",
            self.name,
            self.processors.len()
        );

        if self.processors.is_empty() {
            debug!(
                "Pipeline '{}' is empty, returning DataFrame unchanged",
                self.name
            );
            return Ok(df);
        }

        debug!("Initial DataFrame shape: {:?}", df.shape());

        for (i, processor) in self.processors.iter().enumerate() {
            let processor_name = processor.name();
            debug!(
                "Executing processor {} '{}' - input shape: {:?}",
                i + 1,
                processor_name,
                df.shape()
            );

            processor.validate_schema(&df.schema())?;
            df = processor.process(df)?;

            debug!(
                "Processor '{}' completed - output shape: {:?}",
                processor_name,
                df.shape()
            );
        }

        debug!("Pipeline '{}' completed successfully", self.name);
        Ok(df)
    }
}

impl Default for ProcessingPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Renames columns in mapping order. Missing source columns are skipped.
pub struct ColumnRenamer {
    mappings: Vec<(String, String)>,
}

impl ColumnRenamer {
    pub fn new<I, S>(mappings: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            mappings: mappings
                .into_iter()
                .map(|(old, new)| (old.into(), new.into()))
                .collect(),
        }
    }
}

impl PostProcessor for ColumnRenamer {
    fn process(&self, mut df: DataFrame) -> PostProcessResult<DataFrame> {
        debug!("Renaming columns with {} mappings", self.mappings.len());

        for (old_name, new_name) in &self.mappings {
            if !has_column(&df, old_name) {
                debug!(
                    "Column '{}' not found in DataFrame, skipping rename",
                    old_name
                );
                continue;
            }

            debug!("Renaming column '{}' to '{}'", old_name, new_name);
            df.rename(old_name, new_name.as_str().into())?;
        }

        Ok(df)
    }

    fn name(&self) -> &str {
        "ColumnRenamer"
    }

    fn description(&self) -> &str {
        "Renames columns based on provided mappings"
    }
}

/// Writes `column - offset` into `output_column`, keeping the source column.
pub struct UnitConverter {
    column: String,
    output_column: String,
    from_unit: &'static str,
    to_unit: &'static str,
    offset: f64,
}

impl UnitConverter {
    pub fn kelvin_to_celsius(column: &str, output_column: &str, offset: f64) -> Self {
        Self {
            column: column.to_string(),
            output_column: output_column.to_string(),
            from_unit: "kelvin",
            to_unit: "celsius",
            offset,
        }
    }
}

impl PostProcessor for UnitConverter {
    fn process(&self, df: DataFrame) -> PostProcessResult<DataFrame> {
        debug!(
            "Converting column '{}' from {} to {} into '{}' (offset: {})",
            self.column, self.from_unit, self.to_unit, self.output_column, self.offset
        );

        let result = df
            .lazy()
            .with_columns([(col(self.column.as_str()) - lit(self.offset))
                .alias(self.output_column.as_str())])
            .collect()?;

        Ok(result)
    }

    fn name(&self) -> &str {
        "UnitConverter"
    }

    fn description(&self) -> &str {
        "Converts values in a column from one unit to another"
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.column.clone()]
    }
}

/// Moves `leading` to the front, keeping the remaining columns in order.
pub struct ColumnReorderer {
    leading: Vec<String>,
}

impl ColumnReorderer {
    pub fn new(leading: &[&str]) -> Self {
        Self {
            leading: leading.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PostProcessor for ColumnReorderer {
    fn process(&self, df: DataFrame) -> PostProcessResult<DataFrame> {
        let mut order: Vec<String> = self.leading.clone();
        order.extend(
            df.get_column_names()
                .iter()
                .map(|c| c.to_string())
                .filter(|c| !self.leading.contains(c)),
        );
        debug!("Reordering columns to {:?}", order);

        Ok(df.select(order)?)
    }

    fn name(&self) -> &str {
        "ColumnReorderer"
    }

    fn description(&self) -> &str {
        "Moves a fixed set of columns to the front of the table"
    }

    fn required_columns(&self) -> Vec<String> {
        self.leading.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        df! {
            "latitude" => [27.0, 27.25],
            "longitude" => [89.0, 89.25],
            "t2m" => [273.15, 300.0],
        }
        .unwrap()
    }

    #[test]
    fn test_unit_converter_kelvin_to_celsius() {
        let df = UnitConverter::kelvin_to_celsius("t2m", "t2m_cel", 273.15)
            .process(sample())
            .unwrap();

        let celsius = df.column("t2m_cel").unwrap().f64().unwrap();
        assert!(celsius.get(0).unwrap().abs() < 1e-9);
        assert!((celsius.get(1).unwrap() - 26.85).abs() < 1e-9);
        // source column kept
        assert!(df.column("t2m").is_ok());
    }

    #[test]
    fn test_column_renamer_skips_missing() {
        let renamer = ColumnRenamer::new([("t2m", "temperature"), ("tp", "precipitation")]);
        let df = renamer.process(sample()).unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["latitude", "longitude", "temperature"]);
    }

    #[test]
    fn test_column_reorderer() {
        let df = ColumnReorderer::new(&["t2m", "longitude"])
            .process(sample())
            .unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["t2m", "longitude", "latitude"]);
    }

    #[test]
    fn test_pipeline_validates_required_columns() {
        let mut pipeline = ProcessingPipeline::with_name("test".to_string());
        pipeline.add_processor(Box::new(UnitConverter::kelvin_to_celsius(
            "missing", "out", 273.15,
        )));

        let result = pipeline.execute(sample());
        assert!(matches!(result, Err(PostProcessError::ColumnNotFound(c)) if c == "missing"));
    }

    #[test]
    fn test_pipeline_runs_in_order() {
        let mut pipeline = ProcessingPipeline::new();
        assert!(pipeline.is_empty());
        pipeline.add_processor(Box::new(UnitConverter::kelvin_to_celsius(
            "t2m", "t2m_cel", 273.15,
        )));
        pipeline.add_processor(Box::new(ColumnRenamer::new([("t2m_cel", "temperature")])));
        pipeline.add_processor(Box::new(ColumnReorderer::new(&["temperature"])));
        assert_eq!(pipeline.len(), 3);

        let df = pipeline.execute(sample()).unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["temperature", "latitude", "longitude", "t2m"]);
    }
}
