use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Env;
use grib2csv::cli::Cli;
use grib2csv::input::RegionConfig;
use grib2csv::log::{config_echo, show_farewell_with_timing, show_greeting, show_run_summary};
use grib2csv::run_pipeline;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_filter())).init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let started_at = Local::now();
    let quiet = cli.quiet;
    let config_path = cli.yaml_file.display().to_string();

    if !quiet {
        show_greeting(&config_path, started_at);
    }

    let region = RegionConfig::from_file(&cli.yaml_file)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    let config = cli
        .to_pipeline_config(&region)
        .context("Invalid run configuration")?;

    if !quiet {
        config_echo(&config);
    }

    let report = run_pipeline(&config, !quiet)
        .await
        .context("Failed to set up the pipeline")?;

    if !quiet {
        show_run_summary(&report);
        show_farewell_with_timing(&report, Local::now());
    }
    Ok(report.status)
}
