//! Probe scheduler
//!
//! Emits one `MonitoringTask` per service every `health_check_interval`
//! seconds. Each service gets an independent emitter task holding a child
//! cancellation token; cancelling the scheduler's root token terminates all
//! emitters within one tick.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick ─► MonitoringTask ─► execute-health-check (key = service_id)
//!     ↑
//!     └── add / update / remove (startup hydration + service CRUD stream)
//! ```
//!
//! Publish errors are logged and skipped; the next tick recovers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::broker::payload::{EventPayload, MonitoringTask};
use crate::broker::{topics, Broker, Subscription};
use crate::catalog::ScheduleEntry;
use crate::rpc::CatalogClient;

struct Emitter {
    cancel: CancellationToken,
    url: String,
    interval_secs: u64,
}

/// Drives periodic probes for every registered service
pub struct Scheduler {
    broker: Arc<dyn Broker>,

    /// Root of every emitter's cancellation token
    root: CancellationToken,

    /// service_id → running emitter
    emitters: Mutex<HashMap<u64, Emitter>>,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>, root: CancellationToken) -> Self {
        Self {
            broker,
            root,
            emitters: Mutex::new(HashMap::new()),
        }
    }

    /// Start emitters for the full catalog (startup hydration)
    pub fn hydrate(&self, entries: Vec<ScheduleEntry>) {
        for entry in entries {
            self.add(entry);
        }
    }

    /// Start an emitter for a service. Idempotent: a service that already
    /// has one is left untouched.
    pub fn add(&self, entry: ScheduleEntry) {
        let mut emitters = self.emitters.lock().expect("scheduler mutex poisoned");
        if emitters.contains_key(&entry.service_id) {
            debug!("emitter for service {} already running", entry.service_id);
            return;
        }

        let service_id = entry.service_id;
        emitters.insert(service_id, self.spawn_emitter(entry));
        debug!("emitter started for service {service_id}");
    }

    /// Apply a catalog change. Restarts the emitter only when the interval
    /// or URL actually changed; unknown services are added.
    pub fn update(&self, entry: ScheduleEntry) {
        let mut emitters = self.emitters.lock().expect("scheduler mutex poisoned");

        if let Some(existing) = emitters.get(&entry.service_id) {
            if existing.interval_secs == entry.health_check_interval && existing.url == entry.url {
                return;
            }
            existing.cancel.cancel();
        }

        let service_id = entry.service_id;
        emitters.insert(service_id, self.spawn_emitter(entry));
        debug!("emitter restarted for service {service_id}");
    }

    /// Stop probing a service. Idempotent.
    pub fn remove(&self, service_id: u64) {
        let mut emitters = self.emitters.lock().expect("scheduler mutex poisoned");
        if let Some(emitter) = emitters.remove(&service_id) {
            emitter.cancel.cancel();
            debug!("emitter stopped for service {service_id}");
        }
    }

    /// Number of services currently being probed
    pub fn emitter_count(&self) -> usize {
        self.emitters.lock().expect("scheduler mutex poisoned").len()
    }

    fn spawn_emitter(&self, entry: ScheduleEntry) -> Emitter {
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let broker = self.broker.clone();

        let ScheduleEntry {
            service_id,
            url,
            health_check_interval,
        } = entry;
        let period = Duration::from_secs(health_check_interval.max(1));
        let task_url = url.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,

                    _ = ticker.tick() => {
                        let task = MonitoringTask {
                            service_id,
                            url: task_url.clone(),
                        };

                        let bytes = match task.to_bytes() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                error!("failed to encode task for service {service_id}: {e:#}");
                                continue;
                            }
                        };

                        if let Err(e) = broker
                            .publish(
                                topics::EXECUTE_HEALTH_CHECK,
                                &service_id.to_string(),
                                &bytes,
                            )
                            .await
                        {
                            warn!("publish failed for service {service_id}, skipping tick: {e}");
                        }
                    }
                }
            }

            debug!("emitter for service {service_id} stopped");
        });

        Emitter {
            cancel,
            url,
            interval_secs: health_check_interval,
        }
    }

    /// Follow the service CRUD stream so the emitter set tracks the catalog.
    ///
    /// The CRUD payload carries no URL, so create/modify re-fetch the
    /// service's schedule row via RPC.
    pub async fn run_maintenance(
        self: Arc<Self>,
        rpc: CatalogClient,
        cancel: CancellationToken,
    ) -> Result<()> {
        for topic in [
            topics::SERVICE_CREATED,
            topics::SERVICE_MODIFIED,
            topics::SERVICE_REMOVED,
        ] {
            let mut subscription = self
                .broker
                .subscribe(topic, &format!("scheduler-{topic}"))
                .await?;

            let scheduler = self.clone();
            let rpc = rpc.clone();
            let token = cancel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,

                        delivery = subscription.next() => {
                            let Some(delivery) = delivery else { break };

                            let payload = match EventPayload::from_bytes(&delivery.payload) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!("dropping malformed {topic} event: {e:#}");
                                    delivery.ack().await;
                                    continue;
                                }
                            };

                            let Some(service_id) = payload.service_id else {
                                warn!("dropping {topic} event without service_id");
                                delivery.ack().await;
                                continue;
                            };

                            let result = match topic {
                                topics::SERVICE_REMOVED => {
                                    scheduler.remove(service_id);
                                    Ok(())
                                }
                                _ => scheduler.refresh_service(&rpc, service_id).await,
                            };

                            match result {
                                Ok(()) => delivery.ack().await,
                                Err(e) => {
                                    error!("failed to apply {topic} for service {service_id}: {e:#}");
                                    delivery.nack().await;
                                }
                            }
                        }
                    }
                }

                debug!("scheduler maintenance for {topic} stopped");
            });
        }

        Ok(())
    }

    #[instrument(skip(self, rpc))]
    async fn refresh_service(&self, rpc: &CatalogClient, service_id: u64) -> Result<()> {
        let rows = rpc.get_all_scheduler_configurations().await?;

        match rows.into_iter().find(|row| row.service_id == service_id) {
            Some(row) => {
                self.update(row);
                Ok(())
            }
            None => {
                // Removed again before we got here; the removal event will
                // clean up the emitter
                warn!("service {service_id} has no schedule row, skipping");
                Ok(())
            }
        }
    }
}
