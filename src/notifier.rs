//! Notifier
//!
//! Consumes `notify-oncaller` events and mails the named on-caller a
//! resolution link. The link embeds a signed acknowledgment token; following
//! it hits the gateway, which feeds an `oncaller-acknowledged` event back
//! into the pipeline.
//!
//! Delivery failures are logged and the message is still acked: retrying a
//! transient SMTP failure is out of scope, and re-notification comes from
//! the next escalation level anyway.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::payload::EventPayload;
use crate::broker::{topics, Broker, Subscription};
use crate::config::NotifierConfig;
use crate::gateway::RESOLVE_ENDPOINT_PATH;
use crate::token::TokenCodec;

const SUBSCRIPTION_GROUP: &str = "notifier-notify-oncaller";

/// Outbound mail seam
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_notification(
        &self,
        to: &str,
        incident_id: &str,
        service_id: u64,
        resolve_link: &str,
    ) -> Result<()>;
}

/// SMTP mailer (STARTTLS relay)
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: lettre::message::Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &NotifierConfig, password: Option<String>) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .context("Failed to configure SMTP relay")?
            .port(config.smtp_port);

        if let (Some(user), Some(password)) = (config.smtp_user.clone(), password) {
            builder = builder.credentials(Credentials::new(user, password));
        }

        let from = config
            .from
            .parse()
            .context("Invalid notifier from address")?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_notification(
        &self,
        to: &str,
        incident_id: &str,
        service_id: u64,
        resolve_link: &str,
    ) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse().context("Invalid recipient address")?)
            .subject(format!("[ALERT] New Incident: {incident_id}"))
            .header(ContentType::TEXT_HTML)
            .body(format!(
                "<h2>You've got a new incident!</h2>\
                 <p><strong>ID:</strong> {incident_id}</p>\
                 <p><strong>Service:</strong> {service_id}</p>\
                 <p><a href=\"{resolve_link}\">Acknowledge and resolve</a></p>"
            ))
            .context("Failed to build notification mail")?;

        self.transport
            .send(message)
            .await
            .context("Failed to send email")?;

        info!("notification sent to {to} for incident {incident_id}");

        Ok(())
    }
}

/// Turns `notify-oncaller` events into mail
pub struct Notifier {
    broker: Arc<dyn Broker>,
    mailer: Arc<dyn Mailer>,
    tokens: TokenCodec,
    resolve_base_url: String,
}

impl Notifier {
    pub fn new(
        broker: Arc<dyn Broker>,
        mailer: Arc<dyn Mailer>,
        tokens: TokenCodec,
        resolve_base_url: &str,
    ) -> Self {
        Self {
            broker,
            mailer,
            tokens,
            resolve_base_url: resolve_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build the signed resolution link for one notification
    pub fn resolve_link(&self, incident_id: &str, service_id: u64, oncaller: &str) -> Result<String> {
        let token = self.tokens.sign(incident_id, service_id, oncaller)?;
        Ok(format!(
            "{}{RESOLVE_ENDPOINT_PATH}/{token}",
            self.resolve_base_url
        ))
    }

    /// Consume notifications until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut subscription = self
            .broker
            .subscribe(topics::NOTIFY_ONCALLER, SUBSCRIPTION_GROUP)
            .await?;

        debug!("notifier running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };

                    match EventPayload::from_bytes(&delivery.payload) {
                        Ok(payload) => self.handle_notify(&payload).await,
                        Err(e) => warn!("dropping malformed notify-oncaller event: {e:#}"),
                    }

                    // Always acked: a lost mail is observable in logs only
                    delivery.ack().await;
                }
            }
        }

        debug!("notifier stopped");
        Ok(())
    }

    /// Mail one on-caller. Failures are logged, never propagated.
    #[instrument(skip(self, payload))]
    pub async fn handle_notify(&self, payload: &EventPayload) {
        let (Some(incident_id), Some(service_id), Some(oncaller)) = (
            payload.incident_id.as_deref(),
            payload.service_id,
            payload.oncaller.as_deref(),
        ) else {
            warn!("notify-oncaller event missing fields, dropping");
            return;
        };

        let link = match self.resolve_link(incident_id, service_id, oncaller) {
            Ok(link) => link,
            Err(e) => {
                error!("failed to build resolve link for incident {incident_id}: {e:#}");
                return;
            }
        };

        if let Err(e) = self
            .mailer
            .send_notification(oncaller, incident_id, service_id, &link)
            .await
        {
            error!("failed to notify {oncaller} for incident {incident_id}: {e:#}");
        }
    }
}
