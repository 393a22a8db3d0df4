//! # Table Output Module
//!
//! Encodes DataFrames as CSV or Parquet bytes and writes them to local
//! files. The published day tables and the intermediate per-step tables
//! both go through here, so they share one encoding path.
//!
//! ## Features
//!
//! - **In-memory encoding**: Bytes are produced once and handed to either
//!   local storage or the object store
//! - **Detailed logging**: Shows DataFrame shape, schema and head at debug level

use clap::ValueEnum;
use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to encode table as {format}: {source}")]
    Encode {
        format: OutputFormat,
        #[source]
        source: PolarsError,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// File format of the published day tables.
#[derive(ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    #[default]
    Csv,
    /// Apache Parquet, snappy compressed
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

fn log_table(df: &DataFrame) {
    debug!("DataFrame shape: {:?}", df.shape());
    debug!("DataFrame schema:\n{:?}", df.schema());
    debug!("First few rows:\n{}", df.head(Some(5)));
}

/// Encodes `df` into an in-memory buffer.
pub fn encode_dataframe(df: &DataFrame, format: OutputFormat) -> Result<Vec<u8>, OutputError> {
    log_table(df);

    let mut buffer: Vec<u8> = Vec::new();
    let mut df = df.clone();
    let result = match format {
        OutputFormat::Csv => CsvWriter::new(&mut buffer)
            .include_header(true)
            .finish(&mut df),
        OutputFormat::Parquet => ParquetWriter::new(&mut buffer)
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut df)
            .map(|_| ()),
    };
    result.map_err(|source| OutputError::Encode { format, source })?;

    debug!("Encoded {} rows as {} ({} bytes)", df.height(), format, buffer.len());
    Ok(buffer)
}

/// Writes a per-step table as CSV, creating parent directories.
pub fn write_step_table(df: &DataFrame, path: &Path) -> Result<(), OutputError> {
    debug!("Writing step table: {}", path.display());
    let io_error = |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut file = File::create(path).map_err(io_error)?;
    let mut df = df.clone();
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)
        .map_err(|source| OutputError::Encode {
            format: OutputFormat::Csv,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample() -> DataFrame {
        df! {
            "longitude" => [89.0, 89.25],
            "latitude" => [27.0, 27.0],
            "param" => ["temperature_celcius", "precipitation"],
            "6h" => [Some(12.5), None],
        }
        .unwrap()
    }

    #[test]
    fn test_csv_encoding_has_header() {
        let bytes = encode_dataframe(&sample(), OutputFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let first_line = text.lines().next().unwrap();
        assert_eq!(first_line, "longitude,latitude,param,6h");
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_parquet_encoding_reads_back() {
        let bytes = encode_dataframe(&sample(), OutputFormat::Parquet).unwrap();
        assert_eq!(&bytes[0..4], b"PAR1");

        let df = ParquetReader::new(Cursor::new(bytes)).finish().unwrap();
        assert_eq!(df.shape(), (2, 4));
        assert_eq!(df.column("6h").unwrap().null_count(), 1);
    }

    #[test]
    fn test_write_step_table_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prepped").join("temp").join("step.csv");
        write_step_table(&sample(), &path).unwrap();

        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path))
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn test_extensions() {
        assert_eq!(OutputFormat::Csv.extension(), "csv");
        assert_eq!(OutputFormat::Parquet.extension(), "parquet");
        assert_eq!(OutputFormat::default(), OutputFormat::Csv);
    }
}
