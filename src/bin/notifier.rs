use std::sync::Arc;

use alerting_platform::broker;
use alerting_platform::config::{self, read_config_file};
use alerting_platform::notifier::{Notifier, SmtpMailer};
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
        ("alerting_notifier", LevelFilter::TRACE),
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

    let Some(notifier_config) = config.notifier.clone() else {
        return Err(anyhow::anyhow!("notifier section missing from configuration"));
    };

    let secret = config::ack_secret()?;

    let broker = broker::connect(&config.broker).await?;
    let mailer = Arc::new(SmtpMailer::new(
        &notifier_config,
        config::smtp_password(),
    )?);

    let notifier = Arc::new(Notifier::new(
        broker,
        mailer,
        TokenCodec::new(&secret),
        &notifier_config.resolve_base_url,
    ));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(notifier.run(cancel.clone()));

    info!("notifier running, press Ctrl+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping notifier..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    cancel.cancel();
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("notifier failed: {e:#}"),
        Err(e) => error!("notifier task panicked: {e}"),
    }

    info!("notifier stopped, exiting");
    Ok(())
}
