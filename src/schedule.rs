//! # Day Chunk Planning
//!
//! Produces the forecast-hour schedule for a run and partitions it into
//! per-day chunks. A chunk is the unit of work for the pipeline driver: its
//! offsets are downloaded, decoded, and combined into one published table.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::forecast::{ForecastRequest, date_token};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("step size must be between 1 and 24 hours, got {0}")]
    InvalidStep(u32),

    #[error("number of days must be at least 1")]
    NoDays,
}

/// A contiguous group of forecast offsets treated as one day's work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayChunk {
    /// 1-based position of the chunk within the run.
    pub day: usize,
    /// Strictly increasing forecast hours.
    pub offsets: Vec<u32>,
}

impl DayChunk {
    /// Column labels for the chunk's offsets, e.g. `["6h", "12h"]`.
    pub fn column_names(&self) -> Vec<String> {
        self.offsets.iter().map(|h| hour_label(*h)).collect()
    }

    /// Offsets joined without separator, e.g. `"6121824"`.
    pub fn concatenated_hours(&self) -> String {
        self.offsets.iter().map(|h| h.to_string()).collect()
    }

    pub fn requests(&self, reference_date: NaiveDate) -> Vec<ForecastRequest> {
        self.offsets
            .iter()
            .map(|step| ForecastRequest::new(reference_date, *step))
            .collect()
    }

    /// Name of the published table for this chunk, without directory.
    pub fn output_file_name(&self, reference_date: NaiveDate, extension: &str) -> String {
        format!(
            "ecmwf_data_{}000000_{}h_oper_fc_{}.{}",
            date_token(reference_date),
            self.concatenated_hours(),
            self.day,
            extension
        )
    }
}

pub fn hour_label(hour: u32) -> String {
    format!("{}h", hour)
}

/// Forecast hours `start, start + step, ..., <= num_days * 24`.
pub fn forecast_hours(num_days: u32, step: u32, start: u32) -> Result<Vec<u32>, ScheduleError> {
    validate(num_days, step)?;
    let end = num_days * 24;
    Ok((start..=end).step_by(step as usize).collect())
}

/// Splits `hours` positionally into groups of `24 / step`. The last group
/// is shorter when the step does not divide the horizon evenly.
pub fn partition_days(hours: &[u32], step: u32) -> Result<Vec<DayChunk>, ScheduleError> {
    if step == 0 || step > 24 {
        return Err(ScheduleError::InvalidStep(step));
    }
    let chunk_size = (24 / step) as usize;

    Ok(hours
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, offsets)| DayChunk {
            day: i + 1,
            offsets: offsets.to_vec(),
        })
        .collect())
}

/// Full plan for a run, starting at the first step after the reference time.
pub fn plan_chunks(num_days: u32, step: u32) -> Result<Vec<DayChunk>, ScheduleError> {
    let hours = forecast_hours(num_days, step, step)?;
    partition_days(&hours, step)
}

fn validate(num_days: u32, step: u32) -> Result<(), ScheduleError> {
    if step == 0 || step > 24 {
        return Err(ScheduleError::InvalidStep(step));
    }
    if num_days == 0 {
        return Err(ScheduleError::NoDays);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_days_six_hourly() {
        let hours = forecast_hours(5, 6, 6).unwrap();
        assert_eq!(hours.first(), Some(&6));
        assert_eq!(hours.last(), Some(&120));
        assert_eq!(hours.len(), 20);

        let chunks = partition_days(&hours, 6).unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.offsets.len() == 4));
        assert_eq!(chunks[0].offsets, vec![6, 12, 18, 24]);
        assert_eq!(chunks[4].offsets, vec![102, 108, 114, 120]);
        assert_eq!(chunks[4].day, 5);
    }

    #[test]
    fn test_chunks_are_contiguous_and_increasing() {
        let chunks = plan_chunks(3, 3).unwrap();
        let flattened: Vec<u32> = chunks.iter().flat_map(|c| c.offsets.clone()).collect();
        assert_eq!(flattened, forecast_hours(3, 3, 3).unwrap());
        for chunk in &chunks {
            assert!(chunk.offsets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_non_dividing_step_leaves_short_final_chunk() {
        // 24 / 7 = 3 offsets per chunk; 7..=48 by 7 gives 6 offsets
        let chunks = plan_chunks(2, 7).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offsets, vec![7, 14, 21]);
        assert_eq!(chunks[1].offsets, vec![28, 35, 42]);

        let chunks = plan_chunks(2, 10).unwrap();
        assert_eq!(chunks[0].offsets, vec![10, 20]);
        assert_eq!(chunks[1].offsets, vec![30, 40]);
        assert_eq!(chunks.len(), 2);

        let chunks = plan_chunks(2, 5).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].offsets, vec![25, 30, 35, 40]);
        assert_eq!(chunks[2].offsets, vec![45]);
        assert_eq!(chunks[2].day, 3);
    }

    #[test]
    fn test_invalid_steps() {
        assert_eq!(plan_chunks(5, 0), Err(ScheduleError::InvalidStep(0)));
        assert_eq!(plan_chunks(5, 25), Err(ScheduleError::InvalidStep(25)));
        assert_eq!(plan_chunks(0, 6), Err(ScheduleError::NoDays));
    }

    #[test]
    fn test_chunk_labels_and_output_name() {
        let chunk = DayChunk {
            day: 1,
            offsets: vec![6, 12, 18, 24],
        };
        assert_eq!(chunk.column_names(), vec!["6h", "12h", "18h", "24h"]);
        assert_eq!(chunk.concatenated_hours(), "6121824");

        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            chunk.output_file_name(date, "csv"),
            "ecmwf_data_20240131000000_6121824h_oper_fc_1.csv"
        );
        assert_eq!(chunk.requests(date).len(), 4);
        assert_eq!(chunk.requests(date)[2].step, 18);
    }
}
