use crate::input::PipelineConfig;
use crate::pipeline::{DayStatus, RunReport};
use chrono::{DateTime, Local};
use std::time::Duration;

pub fn show_greeting(config_path: &str, started_at: DateTime<Local>) {
    println!("=== ECMWF GRIB2 to CSV Pipeline ===");
    println!("Started at: {}", started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Loading configuration from: {}", config_path);
}

pub fn config_echo(config: &PipelineConfig) {
    println!("\nConfiguration:");
    println!("  Reference date: {}", config.reference_date);
    println!("  Source: {}", config.source_url);
    println!("  Download path: {}", config.download_dir.display());
    println!("  Step tables: {}", config.step_dir.display());
    println!("  Prepped path: {}", config.publish_dir.display());
    println!("  Days: {}", config.number_of_days);
    println!("  Step: {}h", config.step);
    println!(
        "  Region: lat [{}, {}], lon [{}, {}]",
        config.bounds.min_lat, config.bounds.max_lat, config.bounds.min_lon, config.bounds.max_lon
    );
    println!("  Output format: {}", config.output_format);
    println!("  Push destination: {}", config.destination);
    if let Some(s3) = &config.s3 {
        println!("  Bucket: {} ({})", s3.bucket_name, s3.s3_region);
        println!("  Push data path: {}", config.push_data_path);
        println!("  Delete existing objects: {}", config.clears_remote_first());
    }

    for (i, selector) in config.selectors.iter().enumerate() {
        match selector.level {
            Some(level) => println!("    Level {}: {} = {}", i + 1, selector.kind, level),
            None => println!("    Level {}: {}", i + 1, selector.kind),
        }
    }
}

pub fn show_run_summary(report: &RunReport) {
    println!("\nDays:");
    for day in &report.days {
        let status = match day.status {
            DayStatus::Written => "written",
            DayStatus::Uploaded => "uploaded",
            DayStatus::UploadFailed => "UPLOAD FAILED",
        };
        println!("  Day {}: {} rows -> {} [{}]", day.day, day.rows, day.location, status);
    }

    if !report.uploaded.is_empty() {
        println!("Uploaded files: {:?}", report.uploaded);
    }
    if let Some(step) = &report.failed_step {
        println!(
            "Failed at step '{}': {}",
            step,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    if let Ok(json) = serde_json::to_string_pretty(report) {
        log::debug!("Run report:\n{}", json);
    }
}

/// Seconds up to a minute, `H:MM:SS` beyond. The cut-off is taken on the
/// elapsed time rounded to whole seconds.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let total = secs.round() as u64;
    if total <= 60 {
        format!("{:.2} seconds", secs)
    } else {
        format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

pub fn show_farewell_with_timing(report: &RunReport, finished_at: DateTime<Local>) {
    println!("\nFinished at: {}", finished_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Total time taken: {}", format_elapsed(report.elapsed));
    if report.status {
        println!("\n=== Pipeline completed successfully! ===");
    } else {
        println!("\n=== Pipeline failed ===");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50 seconds");
        assert_eq!(format_elapsed(Duration::from_secs(60)), "60.00 seconds");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "0:01:01");
        assert_eq!(format_elapsed(Duration::from_millis(60_400)), "60.40 seconds");
        assert_eq!(format_elapsed(Duration::from_millis(60_600)), "0:01:01");
        assert_eq!(format_elapsed(Duration::from_millis(119_600)), "0:02:00");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 5)), "3:00:05");
    }
}
