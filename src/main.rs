//! Database backup execution and streaming pipeline.
//!
//! Runs an external dump tool, streams its output to local spool storage and
//! S3-compatible object storage concurrently, and records every job outcome.

mod config;
mod dump;
mod errors;
mod progress;
mod runner;
mod schedule;
mod store;
mod upload;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppSettings;
use progress::ProgressSink;
use runner::{BackupRunner, JobOutcome};
use schedule::Scheduler;
use store::JobRecordStore;
use upload::S3Uploader;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let settings = AppSettings::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let store = Arc::new(JobRecordStore::new(&settings.record_store_path));
    let uploader = Arc::new(S3Uploader::connect(&settings.request.storage).await?);
    let runner = Arc::new(BackupRunner::new(
        store,
        uploader,
        settings.spool_dir.clone(),
    ));

    match settings.request.schedule.clone() {
        Some(cron_spec) => {
            let scheduler = Scheduler::new(runner);
            let identity = settings.request.schedule_identity();
            let request = settings.request.clone();
            scheduler
                .register(&identity, &cron_spec, Arc::new(move || request.clone()))
                .await?;
            info!(identity = %identity, cron_spec = %cron_spec, "schedule registered, waiting for shutdown signal");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            scheduler.shutdown().await;
        }
        None => {
            let (progress, rx) = ProgressSink::channel();
            let drain = progress::drain_to_log(settings.request.database.clone(), rx);
            let outcome = runner
                .execute(&settings.request, progress, CancellationToken::new())
                .await?;
            let _ = drain.await;
            match outcome {
                JobOutcome::Completed { download_url } => {
                    info!(download_url = %download_url, "backup completed");
                }
                JobOutcome::Failed { detail } => anyhow::bail!("backup failed: {detail}"),
                JobOutcome::Cancelled => info!("backup cancelled"),
            }
        }
    }
    Ok(())
}
