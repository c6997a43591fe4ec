//! Host binary: runs extraction batches against an HTTP object store.
//!
//! Logs go to stderr; each batch report is printed to stdout as one JSON line
//! so the caller can pick up `nextRange`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use remote_unzip::report::SUMMARY_LIMIT;
use remote_unzip::{
    BatchStatus, ChunkedExtractionScheduler, Cli, ExtractConfig, HttpObjectStore, ObjectLocation,
};

/// Cancel this long before the time budget runs out, so uploads can fail
/// cleanly and the report still gets written.
const BUDGET_SAFETY_MARGIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    let store = Arc::new(
        HttpObjectStore::new(cli.endpoint.clone())
            .context("building HTTP client")?
            .with_meta_prefix(cli.meta_prefix.clone()),
    );
    let source = ObjectLocation::new(cli.bucket.clone(), cli.region.clone(), cli.key.clone());
    let started = tokio::time::Instant::now();
    let deadline = cli.time_budget_secs.map(|secs| {
        started + Duration::from_secs(secs).saturating_sub(BUDGET_SAFETY_MARGIN)
    });

    let mut range = cli.range;
    loop {
        let scheduler = Arc::new(
            ChunkedExtractionScheduler::new(Arc::clone(&store), config.clone())
                .context("invalid extraction config")?,
        );
        let timer = deadline.map(|deadline| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                scheduler.cancel("time budget exhausted");
            })
        });

        let outcome = scheduler.run(&source, range).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        let report = outcome.with_context(|| format!("extracting {source}"))?;

        for line in report.summary(SUMMARY_LIMIT) {
            info!("{line}");
        }
        info!(bytes = store.transferred_bytes(), "total bytes transferred");
        println!("{}", serde_json::to_string(&report)?);

        let status = report.status();
        match (status, report.next_range) {
            (BatchStatus::Success, Some(next)) if cli.follow => {
                info!(next = %next, "continuing with next range");
                range = Some(next);
            }
            (BatchStatus::Success, _) => return Ok(()),
            (BatchStatus::PartialFailure, _) => {
                let failed = report.results.len() - report.succeeded();
                if let Some(reason) = &report.cancelled {
                    warn!(reason = %reason, "batch was cancelled");
                }
                bail!("{failed} of {} entries of {source} failed", report.results.len());
            }
        }
    }
}

async fn load_config(cli: &Cli) -> Result<ExtractConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ExtractConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}
