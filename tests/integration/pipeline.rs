//! End-to-end pipeline test: scheduler → worker → incident manager →
//! notifier → gateway → incident manager, all over the in-process broker
//! with a failing endpoint standing in for the monitored service.

use std::sync::Arc;
use std::time::Duration;

use alerting_platform::broker::{topics, Broker};
use alerting_platform::catalog::{ScheduleEntry, ServiceCatalog};
use alerting_platform::config::{ManagerConfig, WorkerConfig};
use alerting_platform::gateway::{spawn_gateway, GatewayState};
use alerting_platform::manager::IncidentManager;
use alerting_platform::notifier::Notifier;
use alerting_platform::scheduler::Scheduler;
use alerting_platform::store::memory::MemoryStore;
use alerting_platform::store::RuntimeStore;
use alerting_platform::token::TokenCodec;
use alerting_platform::worker::ProbeWorker;
use alerting_platform::broker::memory::InProcessBroker;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{catalog_entry, expect_event, RecordingMailer};

const SECRET: &str = "pipeline-test-secret";

#[tokio::test]
async fn outage_is_detected_notified_and_resolved() {
    // The monitored service, permanently down
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target)
        .await;

    let broker = Arc::new(InProcessBroker::new());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    // Incident manager: alert window 0 so the second DOWN verdict opens
    let catalog = Arc::new(ServiceCatalog::new());
    catalog.hydrate(vec![catalog_entry(1, 0, &["a@x"])]);

    let manager = Arc::new(IncidentManager::new(
        broker.clone(),
        store.clone(),
        catalog,
        &ManagerConfig::default(),
    ));
    manager.clone().run(cancel.clone()).await.unwrap();

    let mut resolutions = broker
        .subscribe(topics::INCIDENT_RESOLVED, "test-resolved")
        .await
        .unwrap();

    // Acknowledgment gateway
    let gateway_addr = spawn_gateway(
        "127.0.0.1:0".parse().unwrap(),
        GatewayState::new(broker.clone(), Arc::new(TokenCodec::new(SECRET))),
        cancel.clone(),
    )
    .await
    .unwrap();

    // Notifier whose links point at the gateway we just started
    let mailer = Arc::new(RecordingMailer::default());
    let notifier = Arc::new(Notifier::new(
        broker.clone(),
        mailer.clone(),
        TokenCodec::new(SECRET),
        &format!("http://{gateway_addr}"),
    ));
    tokio::spawn(notifier.run(cancel.clone()));

    // Probe worker
    let worker = Arc::new(
        ProbeWorker::new(
            broker.clone(),
            &WorkerConfig {
                max_outstanding: 4,
                probe_timeout_secs: 2,
            },
        )
        .unwrap(),
    );
    tokio::spawn(worker.run(cancel.clone()));

    // Scheduler last, so every consumer is already subscribed
    let target_url = url::Url::parse(&target.uri()).unwrap();
    let scheduler_cancel = cancel.child_token();
    let scheduler = Scheduler::new(broker.clone(), scheduler_cancel.clone());
    scheduler.add(ScheduleEntry {
        service_id: 1,
        url: target_url.to_string(),
        health_check_interval: 1,
    });

    // Probes flow until the sustained outage opens an incident and the
    // first on-caller is mailed
    let mail = timeout(Duration::from_secs(15), async {
        loop {
            if let Some(mail) = mailer.sent().into_iter().next() {
                break mail;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no notification arrived");

    assert_eq!(mail.to, "a@x");
    assert_eq!(mail.service_id, 1);

    let record = store.incident(1).await.unwrap().expect("incident should be open");
    assert_eq!(record.incident_id, mail.incident_id);

    // Stop probing so resolution below is not raced by fresh verdicts
    scheduler_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The on-caller follows their link
    let response = reqwest::get(&mail.resolve_link).await.unwrap();
    assert_eq!(response.status(), 200);

    let resolved = expect_event(&mut resolutions).await;
    assert_eq!(resolved.incident_id.as_deref(), Some(mail.incident_id.as_str()));
    assert_eq!(resolved.oncaller.as_deref(), Some("a@x"));

    // The runtime pair is gone; the platform is ready for the next outage
    let cleared = timeout(Duration::from_secs(5), async {
        loop {
            if store.incident(1).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(cleared.is_ok(), "incident record should have been cleared");

    cancel.cancel();
}
