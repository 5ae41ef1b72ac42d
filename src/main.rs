use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info, LevelFilter};

mod api;
mod config;
mod database;
mod detector;
mod enrichment;
mod error;
mod ingest;
mod loader;
mod pipeline;
mod reports;
mod scraper;
mod telegram;
mod transform;

use config::Settings;

/// Telegram channel ETL: scrape, load, transform, enrich, report.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Log in to Telegram interactively and save the session file
    Login,
    /// Scrape messages and photos from the configured channels
    Scrape,
    /// Load scraped JSON files into raw.messages
    Load,
    /// Run `dbt build` to refresh the warehouse models
    Transform,
    /// Detect objects in scraped images
    Enrich,
    /// Run scrape, load, transform and enrich once
    Run,
    /// Run the pipeline every day at SCHEDULE_AT
    Schedule,
    /// Serve the reporting API
    Serve,
}

async fn execute(command: Command, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Command::Login => telegram::login(&settings.telegram)
            .await
            .context("Telegram login failed")?,
        Command::Scrape => {
            let reports = scraper::scrape_channels(settings)
                .await
                .context("scraping failed")?;
            info!("--- Scraping completed for {} channels. ---", reports.len());
        }
        Command::Load => {
            let report = loader::load_raw_messages(settings)
                .await
                .context("raw load failed")?;
            info!("Data loading finished: {}", report);
        }
        Command::Transform => {
            let summary = transform::run_dbt(settings)
                .await
                .context("transform failed")?;
            info!("Transform finished: {}", summary);
        }
        Command::Enrich => {
            let report = enrichment::run_enrichment(settings)
                .await
                .context("image enrichment failed")?;
            info!("Enrichment finished: {}", report);
        }
        Command::Run => {
            let report = pipeline::run_once(settings).await;
            if !report.succeeded() {
                let stage = report.failed_stage().map(|s| s.name).unwrap_or("unknown");
                anyhow::bail!("pipeline run {} failed at stage {}", report.run_id, stage);
            }
        }
        Command::Schedule => pipeline::run_daily(settings)
            .await
            .context("scheduler stopped")?,
        Command::Serve => api::serve(settings).await.context("API server failed")?,
    }
    Ok(())
}

fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(settings.log_level)
        .with_module_level("sqlx", LevelFilter::Warn)
        .init()
    {
        eprintln!("failed to initialize logger: {}", e);
        return ExitCode::FAILURE;
    }

    // API gets worker threads; batch stages run on one thread.
    let runtime = match cli.command {
        Command::Serve => tokio::runtime::Builder::new_multi_thread(),
        _ => tokio::runtime::Builder::new_current_thread(),
    }
    .enable_all()
    .build();
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli.command, &settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
