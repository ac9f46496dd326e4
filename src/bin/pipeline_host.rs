use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use db_intel_pipeline::config::PipelineConfig;
use db_intel_pipeline::health::HealthServer;
use db_intel_pipeline::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(
    name = "db-intel-pipeline",
    about = "Database intelligence processor pipeline host",
    version
)]
struct Args {
    /// Path to the pipeline configuration file (TOML)
    #[arg(short, long, env = "DB_INTEL_CONFIG")]
    config: Option<String>,

    /// Override the health listen address
    #[arg(long)]
    listen: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => {
            info!("No configuration file given, using defaults");
            PipelineConfig::default()
        }
    };

    if args.print_config {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("rendering configuration")?
        );
        return Ok(());
    }

    let health_config = config.health.clone();
    let pipeline = Arc::new(
        Pipeline::start_with_defaults(config)
            .await
            .context("starting pipeline")?,
    );
    info!(run_id = %pipeline.run_id(), "pipeline started");

    if health_config.enabled {
        let listen = args.listen.unwrap_or(health_config.listen);
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{listen}'"))?;
        let server = HealthServer::new(pipeline.clone());
        tokio::spawn(async move {
            if let Err(e) = server.start(addr).await {
                error!("Health server failed: {e}");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received, draining pipeline");
    pipeline.shutdown().await;
    info!("Pipeline stopped");

    Ok(())
}
