use std::net::SocketAddr;
use std::sync::Arc;

use alerting_platform::broker;
use alerting_platform::config::{self, read_config_file};
use alerting_platform::gateway::{spawn_gateway, GatewayState};
use alerting_platform::token::TokenCodec;
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
        ("alerting_gateway", LevelFilter::TRACE),
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

    let bind_addr: SocketAddr =
        format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;

    let state = GatewayState::new(broker, Arc::new(TokenCodec::new(&secret)));

    let cancel = CancellationToken::new();
    let addr = spawn_gateway(bind_addr, state, cancel.clone()).await?;

    info!("gateway listening on http://{addr}, press Ctrl+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping gateway..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("gateway stopped, exiting");
    Ok(())
}
