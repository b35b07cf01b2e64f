use std::sync::Arc;

use alerting_platform::catalog::ServiceCatalog;
use alerting_platform::config::read_config_file;
use alerting_platform::manager::IncidentManager;
use alerting_platform::rpc::CatalogClient;
use alerting_platform::store::RuntimeStore;
use alerting_platform::{broker, store};
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
        ("alerting_incident_manager", LevelFilter::TRACE),
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
    let store = store::connect(&config.store).await?;
    store.ping().await?;

    // In-flight incident and deadline keys in the store are authoritative
    // across restarts; only the catalog needs re-hydration
    let rpc = CatalogClient::new(&config.rpc)?;
    let catalog = Arc::new(ServiceCatalog::new());
    catalog.hydrate(rpc.get_all_services_info().await?);
    info!("hydrated {} catalog rows", catalog.len());

    let manager = Arc::new(IncidentManager::new(
        broker,
        store,
        catalog,
        &config.manager,
    ));

    let cancel = CancellationToken::new();
    manager.run(cancel.clone()).await?;

    info!("incident manager running, press Ctrl+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, draining handlers..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("incident manager stopped, exiting");
    Ok(())
}
