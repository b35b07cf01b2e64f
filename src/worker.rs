//! Probe worker
//!
//! Dequeues `MonitoringTask`s, probes the target URL, and publishes an
//! UP/DOWN verdict. Up to `max_outstanding` probes run concurrently, each on
//! its own task holding an owned semaphore permit.
//!
//! ## Message Flow
//!
//! ```text
//! execute-health-check ─► HTTP GET (10s timeout) ─► service-up | service-down
//!                                                       (key = service_id)
//! ```
//!
//! The incoming task is acked only after its verdict was published; a
//! publish failure nacks so the broker redelivers. Undecodable tasks are
//! ack-dropped (poison-pill containment).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::broker::payload::{format_timestamp, EventPayload, MonitoringTask};
use crate::broker::{topics, Broker, Delivery, Subscription};
use crate::config::WorkerConfig;
use crate::ServiceStatus;

const SUBSCRIPTION_GROUP: &str = "worker-execute-health-check";

/// UP iff the response status is in [200, 300)
pub fn verdict_for(status_code: u16) -> ServiceStatus {
    if (200..300).contains(&status_code) {
        ServiceStatus::Up
    } else {
        ServiceStatus::Down
    }
}

/// Executes probes from the task queue
pub struct ProbeWorker {
    broker: Arc<dyn Broker>,

    /// HTTP client (reused across probes for efficiency)
    client: reqwest::Client,

    max_outstanding: usize,
}

impl ProbeWorker {
    pub fn new(broker: Arc<dyn Broker>, config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            broker,
            client,
            max_outstanding: config.max_outstanding,
        })
    }

    /// Consume tasks until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut subscription = self
            .broker
            .subscribe(topics::EXECUTE_HEALTH_CHECK, SUBSCRIPTION_GROUP)
            .await?;

        let permits = Arc::new(Semaphore::new(self.max_outstanding));
        debug!("worker running, {} probes in flight max", self.max_outstanding);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };

                    let task = match MonitoringTask::from_bytes(&delivery.payload) {
                        Ok(task) => task,
                        Err(e) => {
                            warn!("dropping undecodable task: {e:#}");
                            delivery.ack().await;
                            continue;
                        }
                    };

                    // Blocks the receive loop once saturated, which is the
                    // backpressure the outstanding limit is for
                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("probe semaphore closed");

                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.execute(task, delivery).await;
                    });
                }
            }
        }

        debug!("worker stopped");
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(service_id = task.service_id))]
    async fn execute(&self, task: MonitoringTask, delivery: Delivery) {
        let status = self.probe(&task.url).await;

        let topic = match status {
            ServiceStatus::Up => topics::SERVICE_UP,
            ServiceStatus::Down => topics::SERVICE_DOWN,
        };

        let payload = EventPayload {
            service_id: Some(task.service_id),
            timestamp: Some(format_timestamp(Utc::now())),
            ..Default::default()
        };

        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode verdict: {e:#}");
                delivery.nack().await;
                return;
            }
        };

        match self
            .broker
            .publish(topic, &task.service_id.to_string(), &bytes)
            .await
        {
            Ok(()) => {
                debug!("service {} is {status}", task.service_id);
                delivery.ack().await;
            }
            Err(e) => {
                warn!("failed to publish verdict for service {}: {e}", task.service_id);
                delivery.nack().await;
            }
        }
    }

    /// One HTTP GET against the monitored URL
    async fn probe(&self, url: &str) -> ServiceStatus {
        match self.client.get(url).send().await {
            Ok(response) => verdict_for(response.status().as_u16()),
            Err(e) => {
                warn!("request failed for {url}: {e}");
                ServiceStatus::Down
            }
        }
    }
}
