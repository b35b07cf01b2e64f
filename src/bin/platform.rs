//! All-in-one binary: every component in a single process.
//!
//! Intended for development and small deployments; production runs the five
//! component binaries separately. With the in-process broker configured,
//! this is the only binary needed besides the catalog owner.

use std::net::SocketAddr;
use std::sync::Arc;

use alerting_platform::catalog::ServiceCatalog;
use alerting_platform::config::{self, read_config_file};
use alerting_platform::gateway::{spawn_gateway, GatewayState};
use alerting_platform::manager::IncidentManager;
use alerting_platform::notifier::{Notifier, SmtpMailer};
use alerting_platform::rpc::CatalogClient;
use alerting_platform::scheduler::Scheduler;
use alerting_platform::store::RuntimeStore;
use alerting_platform::token::TokenCodec;
use alerting_platform::worker::ProbeWorker;
use alerting_platform::{broker, store};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
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
        ("tower_http", LevelFilter::DEBUG),
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

    let secret = config::ack_secret()?;

    let broker = broker::connect(&config.broker).await?;
    let store = store::connect(&config.store).await?;
    store.ping().await?;

    let rpc = CatalogClient::new(&config.rpc)?;
    let cancel = CancellationToken::new();

    // Incident manager
    let catalog = Arc::new(ServiceCatalog::new());
    catalog.hydrate(rpc.get_all_services_info().await?);
    info!("hydrated {} catalog rows", catalog.len());

    let manager = Arc::new(IncidentManager::new(
        broker.clone(),
        store,
        catalog,
        &config.manager,
    ));
    manager.run(cancel.clone()).await?;
    info!("incident manager started");

    // Scheduler
    let scheduler = Arc::new(Scheduler::new(broker.clone(), cancel.child_token()));
    scheduler.hydrate(rpc.get_all_scheduler_configurations().await?);
    scheduler
        .clone()
        .run_maintenance(rpc, cancel.clone())
        .await?;
    info!("scheduler started with {} emitters", scheduler.emitter_count());

    // Worker
    let worker = Arc::new(ProbeWorker::new(broker.clone(), &config.worker)?);
    tokio::spawn(worker.run(cancel.clone()));
    info!("worker started");

    // Notifier (only when mail is configured)
    match config.notifier.clone() {
        Some(notifier_config) => {
            let mailer = Arc::new(SmtpMailer::new(
                &notifier_config,
                config::smtp_password(),
            )?);
            let notifier = Arc::new(Notifier::new(
                broker.clone(),
                mailer,
                TokenCodec::new(&secret),
                &notifier_config.resolve_base_url,
            ));
            tokio::spawn(notifier.run(cancel.clone()));
            info!("notifier started");
        }
        None => warn!("notifier section missing, on-callers will not be mailed"),
    }

    // Acknowledgment gateway
    let bind_addr: SocketAddr =
        format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = GatewayState::new(broker, Arc::new(TokenCodec::new(&secret)));
    let addr = spawn_gateway(bind_addr, state, cancel.clone()).await?;
    info!("gateway listening on http://{addr}");

    info!("all components started, press Ctrl+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping components..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("all components stopped, exiting");
    Ok(())
}
