//! Incident lifecycle scenarios against the manager with in-memory
//! infrastructure. Timestamps are expressed relative to the wall clock so
//! the alert-window and deadline arithmetic runs unmodified.

use alerting_platform::broker::topics;
use alerting_platform::store::{IncidentRecord, IncidentState, RuntimeStore};
use alerting_platform::ServiceStatus;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use crate::helpers::*;

/// A short blip never opens an incident
#[tokio::test]
async fn short_outage_recovers_without_incident() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut starts = rig.listen(topics::INCIDENT_START).await;

    let now = Utc::now();
    rig.manager
        .handle_service_down(&verdict_payload(1, now - Duration::seconds(200)), now - Duration::seconds(200))
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, now - Duration::seconds(100)), now - Duration::seconds(100))
        .await
        .unwrap();
    rig.manager
        .handle_service_up(&verdict_payload(1, now))
        .await
        .unwrap();

    assert_eq!(rig.store.status(1).await.unwrap(), Some(ServiceStatus::Up));
    assert_eq!(rig.store.down_since(1).await.unwrap(), None);
    assert_eq!(rig.store.incident(1).await.unwrap(), None);
    assert!(rig.store.expired_deadlines(i64::MAX).await.unwrap().is_empty());

    expect_silence(&mut starts).await;
}

/// An outage older than the alert window opens an incident with a
/// deterministic id and notifies the first on-caller
#[tokio::test]
async fn sustained_outage_opens_incident() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut starts = rig.listen(topics::INCIDENT_START).await;
    let mut notifies = rig.listen(topics::NOTIFY_ONCALLER).await;

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    let expected_id = IncidentRecord::derive_id(1, down_since.timestamp());

    let record = rig.store.incident(1).await.unwrap().unwrap();
    assert_eq!(record.incident_id, expected_id);
    assert_eq!(record.state, IncidentState::WaitingForFirstAck);
    assert_eq!(record.first_oncaller, "a@x");
    assert_eq!(record.second_oncaller, "b@x");
    assert_eq!(record.incident_start_time, down_since.timestamp());

    // First deadline is anchored at the outage start: down_since + 5min,
    // which is already in the past here
    let expired = rig.store.expired_deadlines(Utc::now().timestamp()).await.unwrap();
    assert_eq!(expired, vec![1]);

    let start = expect_event(&mut starts).await;
    assert_eq!(start.incident_id.as_deref(), Some(expected_id.as_str()));
    assert_eq!(start.service_id, Some(1));

    let notify = expect_event(&mut notifies).await;
    assert_eq!(notify.oncaller.as_deref(), Some("a@x"));
    assert_eq!(notify.incident_id.as_deref(), Some(expected_id.as_str()));
}

/// A first-level timeout escalates to the second on-caller
#[tokio::test]
async fn first_level_timeout_escalates() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut timeouts = rig.listen(topics::INCIDENT_ACKNOWLEDGE_TIMEOUT).await;
    let mut notifies = rig.listen(topics::NOTIFY_ONCALLER).await;

    let down_since = Utc::now() - Duration::seconds(700);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    // Drop the open-time notification to a@x
    expect_event(&mut notifies).await;

    rig.manager.sweep_deadlines().await.unwrap();

    let timed_out = expect_event(&mut timeouts).await;
    assert_eq!(timed_out.oncaller.as_deref(), Some("a@x"));

    let record = rig.store.incident(1).await.unwrap().unwrap();
    assert_eq!(record.state, IncidentState::WaitingForSecondAck);

    // Second level gets a fresh window anchored at now
    let now = Utc::now().timestamp();
    assert!(rig.store.expired_deadlines(now).await.unwrap().is_empty());
    assert_eq!(
        rig.store.expired_deadlines(now + 301).await.unwrap(),
        vec![1]
    );

    let escalation = expect_event(&mut notifies).await;
    assert_eq!(escalation.oncaller.as_deref(), Some("b@x"));
}

/// An acknowledgment resolves the incident and clears the pair
#[tokio::test]
async fn acknowledgment_resolves() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut resolutions = rig.listen(topics::INCIDENT_RESOLVED).await;

    let down_since = Utc::now() - Duration::seconds(700);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();
    rig.manager.sweep_deadlines().await.unwrap();

    let incident_id = IncidentRecord::derive_id(1, down_since.timestamp());
    rig.manager
        .handle_acknowledged(&ack_payload(&incident_id, 1, "b@x"))
        .await
        .unwrap();

    assert_eq!(rig.store.incident(1).await.unwrap(), None);
    assert_eq!(rig.store.down_since(1).await.unwrap(), None);
    assert!(rig.store.expired_deadlines(i64::MAX).await.unwrap().is_empty());

    let resolved = expect_event(&mut resolutions).await;
    assert_eq!(resolved.incident_id.as_deref(), Some(incident_id.as_str()));
    assert_eq!(resolved.oncaller.as_deref(), Some("b@x"));
}

/// No second on-caller means the first timeout is terminal
#[tokio::test]
async fn timeout_without_second_oncaller_is_unresolved() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x"])]);
    let mut timeouts = rig.listen(topics::INCIDENT_ACKNOWLEDGE_TIMEOUT).await;
    let mut unresolved = rig.listen(topics::INCIDENT_UNRESOLVED).await;

    let down_since = Utc::now() - Duration::seconds(700);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    rig.manager.sweep_deadlines().await.unwrap();

    let timed_out = expect_event(&mut timeouts).await;
    assert_eq!(timed_out.oncaller.as_deref(), Some("a@x"));

    let terminal = expect_event(&mut unresolved).await;
    assert_eq!(
        terminal.incident_id.as_deref(),
        Some(IncidentRecord::derive_id(1, down_since.timestamp()).as_str())
    );

    assert_eq!(rig.store.incident(1).await.unwrap(), None);
    assert_eq!(rig.store.down_since(1).await.unwrap(), None);
    assert!(rig.store.expired_deadlines(i64::MAX).await.unwrap().is_empty());
}

/// Duplicate DOWN verdicts for the same outage never open a second
/// incident
#[tokio::test]
async fn duplicate_down_verdicts_are_absorbed() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut starts = rig.listen(topics::INCIDENT_START).await;

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();

    for _ in 0..3 {
        rig.manager
            .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
            .await
            .unwrap();
    }

    expect_event(&mut starts).await;
    expect_silence(&mut starts).await;

    let record = rig.store.incident(1).await.unwrap().unwrap();
    assert_eq!(
        record.incident_id,
        IncidentRecord::derive_id(1, down_since.timestamp())
    );
}

/// Removing a service drops its catalog row and every runtime key
#[tokio::test]
async fn service_removal_purges_everything() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();
    assert!(rig.store.incident(1).await.unwrap().is_some());

    rig.manager
        .handle_service_removed(&verdict_payload(1, Utc::now()))
        .await
        .unwrap();

    assert!(rig.catalog.get(1).is_none());
    assert_eq!(rig.store.incident(1).await.unwrap(), None);
    assert_eq!(rig.store.down_since(1).await.unwrap(), None);
    assert_eq!(rig.store.status(1).await.unwrap(), None);
    assert!(rig.store.expired_deadlines(i64::MAX).await.unwrap().is_empty());

    // The sweeper finding nothing for the removed service is a no-op
    rig.manager.sweep_deadlines().await.unwrap();
}

/// An UP verdict while an incident is open clears the outage markers but
/// leaves the incident and its deadline for a human to close
#[tokio::test]
async fn recovery_does_not_cancel_an_open_incident() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    rig.manager
        .handle_service_up(&verdict_payload(1, Utc::now()))
        .await
        .unwrap();

    assert_eq!(rig.store.status(1).await.unwrap(), Some(ServiceStatus::Up));
    assert_eq!(rig.store.down_since(1).await.unwrap(), None);
    assert!(rig.store.incident(1).await.unwrap().is_some());
    assert_eq!(
        rig.store.expired_deadlines(Utc::now().timestamp()).await.unwrap(),
        vec![1]
    );
}

/// A stale acknowledgment (token minted for an earlier incident) is a no-op
#[tokio::test]
async fn stale_acknowledgment_is_ignored() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    rig.manager
        .handle_acknowledged(&ack_payload("1-12345", 1, "a@x"))
        .await
        .unwrap();

    // The live incident survives a mismatched ack
    assert!(rig.store.incident(1).await.unwrap().is_some());
}

/// Acknowledging an already-resolved incident is idempotent (token re-use)
#[tokio::test]
async fn repeated_acknowledgment_is_a_no_op() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    let incident_id = IncidentRecord::derive_id(1, down_since.timestamp());
    let ack = ack_payload(&incident_id, 1, "a@x");

    rig.manager.handle_acknowledged(&ack).await.unwrap();
    rig.manager.handle_acknowledged(&ack).await.unwrap();

    assert_eq!(rig.store.incident(1).await.unwrap(), None);
}

/// After resolution, a still-down service must sustain a fresh alert window
/// before a new incident opens
#[tokio::test]
async fn resolution_resets_the_outage_clock() {
    let rig = rig_with(vec![catalog_entry(1, 300, &["a@x", "b@x"])]);
    let mut starts = rig.listen(topics::INCIDENT_START).await;

    let down_since = Utc::now() - Duration::seconds(400);
    rig.manager
        .handle_service_down(&verdict_payload(1, down_since), down_since)
        .await
        .unwrap();
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();
    expect_event(&mut starts).await;

    let incident_id = IncidentRecord::derive_id(1, down_since.timestamp());
    rig.manager
        .handle_acknowledged(&ack_payload(&incident_id, 1, "a@x"))
        .await
        .unwrap();

    // The service is still down, but down_since was cleared on resolution:
    // this DOWN starts a new streak instead of opening a new incident
    rig.manager
        .handle_service_down(&verdict_payload(1, Utc::now()), Utc::now())
        .await
        .unwrap();

    expect_silence(&mut starts).await;
    assert_eq!(rig.store.incident(1).await.unwrap(), None);
    assert!(rig.store.down_since(1).await.unwrap().is_some());
}
