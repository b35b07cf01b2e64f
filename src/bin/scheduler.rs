use std::sync::Arc;

use alerting_platform::config::read_config_file;
use alerting_platform::rpc::CatalogClient;
use alerting_platform::scheduler::Scheduler;
use alerting_platform::broker;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("alerting_platform", LevelFilter::TRACE),
        ("alerting_scheduler", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    dotenv::dotenv().ok();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    let broker = broker::connect(&config.broker).await?;
    let rpc = CatalogClient::new(&config.rpc)?;

    let cancel = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(broker, cancel.child_token()));

    let entries = rpc.get_all_scheduler_configurations().await?;
    info!("hydrated {} schedule rows from the catalog owner", entries.len());
    scheduler.hydrate(entries);

    scheduler
        .clone()
        .run_maintenance(rpc, cancel.clone())
        .await?;

    info!(
        "scheduler running with {} emitters, press Ctrl+C to shutdown",
        scheduler.emitter_count()
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping emitters..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("scheduler stopped, exiting");
    Ok(())
}
