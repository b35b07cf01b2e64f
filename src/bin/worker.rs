use std::sync::Arc;

use alerting_platform::broker;
use alerting_platform::config::read_config_file;
use alerting_platform::worker::ProbeWorker;
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
        ("alerting_worker", LevelFilter::TRACE),
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
    let worker = Arc::new(ProbeWorker::new(broker, &config.worker)?);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(cancel.clone()));

    info!("worker running, press Ctrl+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, draining probes..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("worker failed: {e:#}"),
        Err(e) => error!("worker task panicked: {e}"),
    }

    info!("worker stopped, exiting");
    Ok(())
}
