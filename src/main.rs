//! flurry: fetches the product catalog and publishes the sales, product and
//! finance projections to object storage and the warehouse.

use clap::Parser;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flurry::config::{Config, WarehouseConfig};
use flurry::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use flurry::pipeline::Pipeline;
use flurry::{metrics, trigger};

/// Product catalog ETL job.
#[derive(Parser, Debug)]
#[command(name = "flurry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without running the job.
    #[arg(long)]
    dry_run: bool,

    /// Serve an HTTP trigger on this address instead of running once.
    #[arg(long, value_name = "ADDR")]
    serve: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ETL failed: {}", e.message());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), PipelineError> {
    info!("flurry starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    if args.dry_run {
        describe(&config);
        info!("Configuration is valid");
        return Ok(());
    }

    let mut pipeline = Pipeline::from_config(&config).await?;

    match args.serve {
        Some(addr) => {
            let addr: SocketAddr = addr.parse().context(AddressParseSnafu)?;
            trigger::serve(addr, pipeline).await
        }
        None => {
            pipeline.run(flurry::RunDate::today()).await?;
            Ok(())
        }
    }
}

fn describe(config: &Config) {
    info!("Dry run mode - validating configuration");
    info!("Source: {}", config.source.url);
    info!(
        "Snapshots: {} (location {})",
        config.snapshot.path, config.snapshot.location
    );
    match &config.warehouse {
        WarehouseConfig::BigQuery(bq) => {
            info!("Warehouse: BigQuery dataset {} ({})", bq.dataset, bq.location);
        }
        WarehouseConfig::Delta(delta) => {
            info!("Warehouse: Delta tables under {}", delta.path);
        }
    }
    if let Some(gcp) = &config.gcp {
        info!("GCP project: {}", gcp.project_id);
    }
}
