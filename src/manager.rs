//! Incident manager
//!
//! The central state machine of the platform. It consumes every event that
//! affects incident state, enforces the runtime-store invariants, emits the
//! downstream incident lifecycle events, and drives deadline-based
//! escalation.
//!
//! ## Event flow
//!
//! ```text
//! service-up ──────────┐
//! service-down ────────┤
//! service-created ─────┤                ┌─► incident-start
//! service-modified ────┼─► handlers ────┼─► notify-oncaller
//! service-removed ─────┤      │         ├─► incident-acknowledge-timeout
//! oncaller-acknowledged┘      │         ├─► incident-resolved
//!                             │         └─► incident-unresolved
//!            deadline sweeper ┘
//! ```
//!
//! ## Concurrency
//!
//! The broker orders events per service, but the deadline sweeper acts on
//! the same services concurrently with ingestion. Every handler therefore
//! takes a per-service async mutex (lazily created, never dropped) for the
//! duration of its store mutations. The in-memory catalog has its own lock
//! inside [`ServiceCatalog`]; rows are copied out before any I/O.
//!
//! Downstream publishes are awaited before the triggering message is acked,
//! so an incident that was opened is guaranteed to have had its
//! `incident-start` accepted by the broker (or the open is retried).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::payload::{format_timestamp, EventPayload};
use crate::broker::{topics, Broker, Delivery, Subscription};
use crate::catalog::{CatalogEntry, ServiceCatalog};
use crate::config::ManagerConfig;
use crate::store::{IncidentRecord, IncidentState, RuntimeStore};
use crate::ServiceStatus;

/// The incident manager
pub struct IncidentManager {
    broker: Arc<dyn Broker>,

    store: Arc<dyn RuntimeStore>,

    catalog: Arc<ServiceCatalog>,

    /// service_id → per-service lock. Entries are created lazily and never
    /// removed; a stale service costs one idle mutex.
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,

    sweep_interval: Duration,
}

impl IncidentManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn RuntimeStore>,
        catalog: Arc<ServiceCatalog>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            catalog,
            locks: Mutex::new(HashMap::new()),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    fn service_lock(&self, service_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("lock map mutex poisoned")
            .entry(service_id)
            .or_default()
            .clone()
    }

    /// Subscribe to every inbound topic and start the deadline sweeper.
    /// Returns once everything is running; cancellation stops it all.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        for topic in [
            topics::SERVICE_UP,
            topics::SERVICE_DOWN,
            topics::SERVICE_CREATED,
            topics::SERVICE_MODIFIED,
            topics::SERVICE_REMOVED,
            topics::ONCALLER_ACKNOWLEDGED,
        ] {
            let mut subscription = self
                .broker
                .subscribe(topic, &format!("incident-manager-{topic}"))
                .await?;

            let manager = self.clone();
            let token = cancel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,

                        delivery = subscription.next() => {
                            let Some(delivery) = delivery else { break };
                            manager.dispatch(topic, delivery).await;
                        }
                    }
                }

                debug!("listener for {topic} stopped");
            });
        }

        let manager = self.clone();
        let token = cancel;
        tokio::spawn(async move {
            let mut ticker = interval(manager.sweep_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,

                    _ = ticker.tick() => {
                        if let Err(e) = manager.sweep_deadlines().await {
                            error!("deadline sweep failed: {e:#}");
                        }
                    }
                }
            }

            debug!("deadline sweeper stopped");
        });

        info!("incident manager running");
        Ok(())
    }

    /// Decode and route one delivery, then ack or nack it.
    ///
    /// Malformed payloads are ack-dropped; handler errors nack so the broker
    /// redelivers (handlers are idempotent).
    async fn dispatch(&self, topic: &str, delivery: Delivery) {
        let payload = match EventPayload::from_bytes(&delivery.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping malformed {topic} event: {e:#}");
                delivery.ack().await;
                return;
            }
        };

        let event_time = payload.event_time();

        let result = match topic {
            topics::SERVICE_UP => self.handle_service_up(&payload).await,
            topics::SERVICE_DOWN => self.handle_service_down(&payload, event_time).await,
            topics::SERVICE_CREATED | topics::SERVICE_MODIFIED => {
                self.handle_catalog_upsert(&payload).await
            }
            topics::SERVICE_REMOVED => self.handle_service_removed(&payload).await,
            topics::ONCALLER_ACKNOWLEDGED => self.handle_acknowledged(&payload).await,
            other => {
                warn!("unknown event type {other}");
                Ok(())
            }
        };

        match result {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                error!("error handling {topic} event: {e:#}");
                delivery.nack().await;
            }
        }
    }

    /// An UP verdict clears the outage markers.
    ///
    /// An incident already open for the service is left in place together
    /// with its deadline: recovery does not substitute for a human
    /// acknowledgment, so the escalation chain keeps running.
    #[instrument(skip(self, payload))]
    pub async fn handle_service_up(&self, payload: &EventPayload) -> Result<()> {
        let Some(service_id) = payload.service_id else {
            warn!("service-up event without service_id, dropping");
            return Ok(());
        };

        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        debug!("service {service_id} is UP");

        self.store.set_status(service_id, ServiceStatus::Up).await?;
        self.store.clear_down_since(service_id).await?;

        Ok(())
    }

    /// A DOWN verdict marks the streak start and opens an incident once the
    /// outage has lasted at least the service's alert window.
    #[instrument(skip(self, payload, event_time))]
    pub async fn handle_service_down(
        &self,
        payload: &EventPayload,
        event_time: DateTime<Utc>,
    ) -> Result<()> {
        let Some(service_id) = payload.service_id else {
            warn!("service-down event without service_id, dropping");
            return Ok(());
        };

        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        debug!("service {service_id} is DOWN");

        self.store
            .set_status(service_id, ServiceStatus::Down)
            .await?;

        let down_since = match self.store.down_since(service_id).await? {
            None => {
                // First DOWN of a new streak: remember where it started
                self.store
                    .set_down_since(service_id, event_time.timestamp())
                    .await?;
                return Ok(());
            }
            Some(epoch) => epoch,
        };

        let Some(service) = self.catalog.get(service_id) else {
            warn!("service {service_id} not found in catalog");
            return Ok(());
        };

        let now = Utc::now().timestamp();
        if now - down_since >= service.alert_window as i64
            && self.store.incident(service_id).await?.is_none()
        {
            self.open_incident(&service, down_since).await?;
        }

        Ok(())
    }

    /// Open an incident for a sustained outage.
    ///
    /// The id is a pure function of `(service_id, down_since)` and the store
    /// insert is a CAS, so a redelivered DOWN verdict can never produce a
    /// second incident.
    async fn open_incident(&self, service: &CatalogEntry, down_since: i64) -> Result<()> {
        let service_id = service.service_id;

        let Some(first_oncaller) = service.first_oncaller() else {
            warn!("service {service_id} has no on-callers, cannot open incident");
            return Ok(());
        };

        let record = IncidentRecord {
            incident_id: IncidentRecord::derive_id(service_id, down_since),
            service_id,
            state: IncidentState::WaitingForFirstAck,
            incident_start_time: down_since,
            allowed_response_time: service.allowed_response_time,
            first_oncaller: first_oncaller.to_string(),
            second_oncaller: service.second_oncaller().to_string(),
        };

        if !self.store.create_incident(&record).await? {
            debug!("incident already open for service {service_id}");
            return Ok(());
        }

        // First level is anchored to the outage start, not `now`:
        // scheduling lateness must not extend the on-caller's window
        let deadline = down_since + record.allowed_response_time as i64 * 60;
        self.store.set_deadline(service_id, deadline).await?;

        info!(
            "opened incident {} for service {service_id}, notifying {}",
            record.incident_id, record.first_oncaller
        );

        self.emit_incident_start(&record).await?;
        self.emit_notify_oncaller(&record, &record.first_oncaller)
            .await?;

        Ok(())
    }

    /// Insert or overwrite the catalog row (`service-created` and
    /// `service-modified`). Snapshots inside active incidents are not
    /// rewritten.
    #[instrument(skip(self, payload))]
    pub async fn handle_catalog_upsert(&self, payload: &EventPayload) -> Result<()> {
        let Some(service_id) = payload.service_id else {
            warn!("catalog event without service_id, dropping");
            return Ok(());
        };

        let Some(data) = &payload.data else {
            warn!("catalog event for service {service_id} without data, dropping");
            return Ok(());
        };

        let (Some(alert_window), Some(allowed_response_time), Some(oncallers)) = (
            data.alert_window,
            data.allowed_response_time,
            data.oncallers.clone(),
        ) else {
            warn!("catalog event for service {service_id} missing fields, dropping");
            return Ok(());
        };

        if oncallers.is_empty() {
            warn!("catalog event for service {service_id} has no on-callers, dropping");
            return Ok(());
        }

        debug!("catalog row for service {service_id} updated");

        self.catalog.upsert(CatalogEntry {
            service_id,
            alert_window,
            allowed_response_time,
            oncallers,
        });

        Ok(())
    }

    /// Drop the catalog row and every runtime key, deadline index included
    #[instrument(skip(self, payload))]
    pub async fn handle_service_removed(&self, payload: &EventPayload) -> Result<()> {
        let Some(service_id) = payload.service_id else {
            warn!("service-removed event without service_id, dropping");
            return Ok(());
        };

        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        debug!("service {service_id} removed");

        self.catalog.remove(service_id);
        self.store.purge_service(service_id).await?;

        Ok(())
    }

    /// An on-caller followed their resolve link
    #[instrument(skip(self, payload))]
    pub async fn handle_acknowledged(&self, payload: &EventPayload) -> Result<()> {
        let Some(service_id) = payload.service_id else {
            warn!("acknowledgment without service_id, dropping");
            return Ok(());
        };
        let Some(incident_id) = payload.incident_id.as_deref() else {
            warn!("acknowledgment without incident_id, dropping");
            return Ok(());
        };
        let oncaller = payload.oncaller.clone().unwrap_or_default();

        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        let Some(record) = self.store.incident(service_id).await? else {
            // Token re-use, or ack raced the sweeper: nothing left to do
            debug!("no active incident for service {service_id}, acknowledgment is a no-op");
            return Ok(());
        };

        if record.incident_id != incident_id {
            warn!(
                "stale acknowledgment of {incident_id} for service {service_id}, active incident is {}",
                record.incident_id
            );
            return Ok(());
        }

        self.store.remove_deadline(service_id).await?;
        self.store.clear_incident(service_id).await?;

        info!("incident {incident_id} resolved by {oncaller}");

        self.emit_incident_resolved(&record, &oncaller).await?;

        Ok(())
    }

    /// One pass over the deadline index; escalates every expired entry
    pub async fn sweep_deadlines(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let expired = self.store.expired_deadlines(now).await?;

        if expired.is_empty() {
            return Ok(());
        }

        debug!("{} expired deadlines", expired.len());

        // Escalations are independent; the per-service locks serialize any
        // overlap with ingestion
        let sweeps = expired.into_iter().map(|service_id| async move {
            if let Err(e) = self.handle_expired_deadline(service_id).await {
                error!("failed to handle expired deadline for service {service_id}: {e:#}");
            }
        });
        future::join_all(sweeps).await;

        Ok(())
    }

    /// Escalate one service whose acknowledgment deadline has passed
    #[instrument(skip(self))]
    pub async fn handle_expired_deadline(&self, service_id: u64) -> Result<()> {
        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        self.store.remove_deadline(service_id).await?;

        let Some(record) = self.store.incident(service_id).await? else {
            // Resolved or removed between the scan and now
            debug!("deadline for service {service_id} raced resolution, nothing to do");
            return Ok(());
        };

        let timed_out = record.awaited_oncaller().to_string();
        debug!(
            "deadline expired for incident {}, on-caller {timed_out} did not respond",
            record.incident_id
        );

        self.emit_ack_timeout(&record, &timed_out).await?;

        match record.state {
            IncidentState::WaitingForFirstAck if !record.second_oncaller.is_empty() => {
                self.store
                    .set_incident_state(service_id, IncidentState::WaitingForSecondAck)
                    .await?;

                // Second level is a fresh window for a fresh human,
                // anchored at now rather than at the outage start
                let deadline = Utc::now().timestamp() + record.allowed_response_time as i64 * 60;
                self.store.set_deadline(service_id, deadline).await?;

                info!(
                    "incident {} escalated to {}",
                    record.incident_id, record.second_oncaller
                );

                self.emit_notify_oncaller(&record, &record.second_oncaller)
                    .await?;
            }
            _ => self.finalize_unresolved(&record).await?,
        }

        Ok(())
    }

    /// Terminal path: nobody acknowledged in time
    async fn finalize_unresolved(&self, record: &IncidentRecord) -> Result<()> {
        self.store.clear_incident(record.service_id).await?;

        info!("incident {} was not resolved in time", record.incident_id);

        self.emit_incident_unresolved(record).await?;

        Ok(())
    }

    async fn emit(&self, topic: &str, ordering_key: &str, payload: &EventPayload) -> Result<()> {
        self.broker
            .publish(topic, ordering_key, &payload.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn emit_incident_start(&self, record: &IncidentRecord) -> Result<()> {
        let started_at = DateTime::<Utc>::from_timestamp(record.incident_start_time, 0)
            .unwrap_or_default();

        let payload = EventPayload {
            incident_id: Some(record.incident_id.clone()),
            service_id: Some(record.service_id),
            timestamp: Some(format_timestamp(started_at)),
            ..Default::default()
        };

        self.emit(topics::INCIDENT_START, &record.incident_id, &payload)
            .await
    }

    async fn emit_notify_oncaller(&self, record: &IncidentRecord, oncaller: &str) -> Result<()> {
        let payload = EventPayload {
            incident_id: Some(record.incident_id.clone()),
            service_id: Some(record.service_id),
            oncaller: Some(oncaller.to_string()),
            timestamp: Some(format_timestamp(Utc::now())),
            ..Default::default()
        };

        self.emit(topics::NOTIFY_ONCALLER, &record.incident_id, &payload)
            .await
    }

    async fn emit_ack_timeout(&self, record: &IncidentRecord, oncaller: &str) -> Result<()> {
        let payload = EventPayload {
            incident_id: Some(record.incident_id.clone()),
            service_id: Some(record.service_id),
            oncaller: Some(oncaller.to_string()),
            timestamp: Some(format_timestamp(Utc::now())),
            ..Default::default()
        };

        self.emit(
            topics::INCIDENT_ACKNOWLEDGE_TIMEOUT,
            &record.incident_id,
            &payload,
        )
        .await
    }

    async fn emit_incident_resolved(&self, record: &IncidentRecord, oncaller: &str) -> Result<()> {
        let payload = EventPayload {
            incident_id: Some(record.incident_id.clone()),
            service_id: Some(record.service_id),
            oncaller: Some(oncaller.to_string()),
            timestamp: Some(format_timestamp(Utc::now())),
            ..Default::default()
        };

        self.emit(topics::INCIDENT_RESOLVED, &record.incident_id, &payload)
            .await
    }

    async fn emit_incident_unresolved(&self, record: &IncidentRecord) -> Result<()> {
        let payload = EventPayload {
            incident_id: Some(record.incident_id.clone()),
            service_id: Some(record.service_id),
            timestamp: Some(format_timestamp(Utc::now())),
            ..Default::default()
        };

        self.emit(topics::INCIDENT_UNRESOLVED, &record.incident_id, &payload)
            .await
    }
}
