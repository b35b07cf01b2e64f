//! Wire payload codec
//!
//! Every platform topic carries JSON. The field names below are the wire
//! contract shared with the REST CRUD collaborator and the logger; do not
//! rename them.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Catalog attributes riding along on service CRUD events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Per-escalation-level acknowledgment budget, in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_response_time: Option<u64>,

    /// Probe period, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u64>,

    /// Minimum sustained outage before an incident opens, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_window: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oncallers: Option<Vec<String>>,
}

/// Common event payload used on every topic except `execute-health-check`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<u64>,

    /// On-caller email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oncaller: Option<String>,

    /// RFC 3339 event time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

impl EventPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode event payload")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to decode event payload")
    }

    /// Event time carried in the payload, falling back to the wall clock
    /// when absent or unparsable
    pub fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

/// Render a timestamp the way every producer on the wire does
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Probe order sent from the scheduler to the worker fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringTask {
    pub service_id: u64,
    pub url: String,
}

impl MonitoringTask {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode monitoring task")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to decode monitoring task")
    }
}
