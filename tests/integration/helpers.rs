//! Helper functions for integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alerting_platform::broker::memory::InProcessBroker;
use alerting_platform::broker::payload::{format_timestamp, EventPayload};
use alerting_platform::broker::{Broker, Subscription};
use alerting_platform::catalog::{CatalogEntry, ServiceCatalog};
use alerting_platform::config::ManagerConfig;
use alerting_platform::manager::IncidentManager;
use alerting_platform::notifier::Mailer;
use alerting_platform::store::memory::MemoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;

/// Manager plus the infrastructure it runs against, all in memory
pub struct TestRig {
    pub broker: Arc<InProcessBroker>,
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<ServiceCatalog>,
    pub manager: Arc<IncidentManager>,
}

pub fn catalog_entry(
    service_id: u64,
    alert_window: u64,
    oncallers: &[&str],
) -> CatalogEntry {
    CatalogEntry {
        service_id,
        alert_window,
        allowed_response_time: 5,
        oncallers: oncallers.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn rig_with(entries: Vec<CatalogEntry>) -> TestRig {
    let broker = Arc::new(InProcessBroker::new());
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(ServiceCatalog::new());
    catalog.hydrate(entries);

    let manager = Arc::new(IncidentManager::new(
        broker.clone(),
        store.clone(),
        catalog.clone(),
        &ManagerConfig::default(),
    ));

    TestRig {
        broker,
        store,
        catalog,
        manager,
    }
}

impl TestRig {
    /// Subscribe to an outbound topic; call before triggering handlers so
    /// the in-process broker has somewhere to deliver
    pub async fn listen(&self, topic: &str) -> Box<dyn Subscription> {
        self.broker
            .subscribe(topic, &format!("test-{topic}"))
            .await
            .unwrap()
    }
}

pub fn verdict_payload(service_id: u64, at: DateTime<Utc>) -> EventPayload {
    EventPayload {
        service_id: Some(service_id),
        timestamp: Some(format_timestamp(at)),
        ..Default::default()
    }
}

pub fn ack_payload(incident_id: &str, service_id: u64, oncaller: &str) -> EventPayload {
    EventPayload {
        incident_id: Some(incident_id.to_string()),
        service_id: Some(service_id),
        oncaller: Some(oncaller.to_string()),
        timestamp: Some(format_timestamp(Utc::now())),
        ..Default::default()
    }
}

/// Next event on the subscription, decoded and acked. Panics after 2s.
pub async fn expect_event(sub: &mut Box<dyn Subscription>) -> EventPayload {
    let delivery = timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed");
    let payload = EventPayload::from_bytes(&delivery.payload).unwrap();
    delivery.ack().await;
    payload
}

/// Asserts nothing arrives on the subscription within 300ms
pub async fn expect_silence(sub: &mut Box<dyn Subscription>) {
    if let Ok(Some(delivery)) = timeout(Duration::from_millis(300), sub.next()).await {
        let payload = EventPayload::from_bytes(&delivery.payload).ok();
        panic!("expected silence, got {payload:?}");
    }
}

/// A mail sent through the [`RecordingMailer`]
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub incident_id: String,
    pub service_id: u64,
    pub resolve_link: String,
}

/// Mailer that records instead of dialing SMTP
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_notification(
        &self,
        to: &str,
        incident_id: &str,
        service_id: u64,
        resolve_link: &str,
    ) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            incident_id: incident_id.to_string(),
            service_id,
            resolve_link: resolve_link.to_string(),
        });
        Ok(())
    }
}
