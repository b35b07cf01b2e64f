//! Runtime key-value store
//!
//! Ephemeral per-service state lives in a shared KV store so it survives
//! process restarts: current status, the start of the running DOWN streak,
//! the in-flight incident record, and the global acknowledgment deadline
//! index. The [`RuntimeStore`] trait is the seam; `RedisStore` is the real
//! backend and `MemoryStore` backs tests and the all-in-one binary.
//!
//! ## Key layout (wire contract)
//!
//! ```text
//! common:service:<id>:status          string  "UP" | "DOWN"
//! <prefix>:service:<id>:down_since    string  unix seconds
//! <prefix>:service:<id>:incident      hash    incident record fields
//! <prefix>:oncaller_deadlines         zset    member = service id,
//!                                             score = unix deadline
//! ```
//!
//! The status key is unprefixed on purpose: it is read by the catalog UI.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::ServiceStatus;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations
#[derive(Debug)]
pub enum StoreError {
    /// Could not reach the store
    ConnectionFailed(String),

    /// A command failed
    OperationFailed(String),

    /// Stored data did not parse back into its record type
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to runtime store: {}", msg)
            }
            StoreError::OperationFailed(msg) => write!(f, "store operation failed: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "corrupt store record: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::OperationFailed(err.to_string())
        }
    }
}

/// Escalation position of an open incident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentState {
    WaitingForFirstAck,
    WaitingForSecondAck,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::WaitingForFirstAck => "WAITING_FOR_FIRST_ACK",
            IncidentState::WaitingForSecondAck => "WAITING_FOR_SECOND_ACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING_FOR_FIRST_ACK" => Some(IncidentState::WaitingForFirstAck),
            "WAITING_FOR_SECOND_ACK" => Some(IncidentState::WaitingForSecondAck),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one open incident (at most one per service)
///
/// The on-caller chain and response budget are snapshotted at open time so
/// catalog edits mid-incident cannot skew routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentRecord {
    /// `"<service_id>-<down_since_epoch>"`: deterministic, so broker
    /// redeliveries de-duplicate
    pub incident_id: String,

    pub service_id: u64,

    pub state: IncidentState,

    /// Unix seconds at which the outage began (`down_since` at open time)
    pub incident_start_time: i64,

    /// Snapshot: acknowledgment budget per level, in minutes
    pub allowed_response_time: u64,

    /// Snapshot: first escalation target
    pub first_oncaller: String,

    /// Snapshot: second escalation target, empty string if none
    pub second_oncaller: String,
}

impl IncidentRecord {
    /// The deterministic incident id for a given outage
    pub fn derive_id(service_id: u64, down_since: i64) -> String {
        format!("{service_id}-{down_since}")
    }

    /// The on-caller currently awaited, per the escalation state
    pub fn awaited_oncaller(&self) -> &str {
        match self.state {
            IncidentState::WaitingForFirstAck => &self.first_oncaller,
            IncidentState::WaitingForSecondAck => &self.second_oncaller,
        }
    }

    /// Hash representation for the store (field names are wire contract)
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("incident_id", self.incident_id.clone()),
            ("service_id", self.service_id.to_string()),
            ("state", self.state.as_str().to_string()),
            ("incident_start_time", self.incident_start_time.to_string()),
            (
                "allowed_response_time",
                self.allowed_response_time.to_string(),
            ),
            ("first_oncaller", self.first_oncaller.clone()),
            ("second_oncaller", self.second_oncaller.clone()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> StoreResult<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("incident hash missing `{name}`")))
        };

        let parse_u64 = |name: &str, raw: &str| {
            raw.parse::<u64>()
                .map_err(|_| StoreError::Corrupt(format!("incident field `{name}` = `{raw}`")))
        };

        let state_raw = get("state")?;
        let state = IncidentState::parse(&state_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown incident state `{state_raw}`")))?;

        Ok(Self {
            incident_id: get("incident_id")?,
            service_id: parse_u64("service_id", &get("service_id")?)?,
            state,
            incident_start_time: get("incident_start_time")?.parse::<i64>().map_err(|_| {
                StoreError::Corrupt("incident field `incident_start_time`".to_string())
            })?,
            allowed_response_time: parse_u64(
                "allowed_response_time",
                &get("allowed_response_time")?,
            )?,
            first_oncaller: get("first_oncaller")?,
            // Absent and empty are the same thing: no second level
            second_oncaller: fields.get("second_oncaller").cloned().unwrap_or_default(),
        })
    }
}

/// Key construction helpers
pub mod keys {
    /// Unprefixed: public read-only to the catalog UI
    pub fn status(service_id: u64) -> String {
        format!("common:service:{service_id}:status")
    }

    pub fn down_since(prefix: &str, service_id: u64) -> String {
        format!("{prefix}:service:{service_id}:down_since")
    }

    pub fn incident(prefix: &str, service_id: u64) -> String {
        format!("{prefix}:service:{service_id}:incident")
    }

    pub fn deadline_set(prefix: &str) -> String {
        format!("{prefix}:oncaller_deadlines")
    }
}

/// Trait for runtime state backends
///
/// All writes for one service are serialized by the incident manager's
/// per-service lock; implementations only need the documented per-call
/// atomicity (the create CAS and the paired deletions).
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    async fn set_status(&self, service_id: u64, status: ServiceStatus) -> StoreResult<()>;

    async fn status(&self, service_id: u64) -> StoreResult<Option<ServiceStatus>>;

    async fn down_since(&self, service_id: u64) -> StoreResult<Option<i64>>;

    async fn set_down_since(&self, service_id: u64, epoch: i64) -> StoreResult<()>;

    async fn clear_down_since(&self, service_id: u64) -> StoreResult<()>;

    /// Create the incident record iff none exists for the service.
    /// Returns `false` (without writing) when a record is already present.
    /// This is the CAS that makes incident opening idempotent across
    /// redeliveries.
    async fn create_incident(&self, record: &IncidentRecord) -> StoreResult<bool>;

    async fn incident(&self, service_id: u64) -> StoreResult<Option<IncidentRecord>>;

    async fn set_incident_state(&self, service_id: u64, state: IncidentState) -> StoreResult<()>;

    /// Delete the incident record and `down_since` together in one atomic
    /// transaction; a half-cleared pair would violate the state invariants
    async fn clear_incident(&self, service_id: u64) -> StoreResult<()>;

    /// Drop every runtime key for a removed service, deadline index included
    async fn purge_service(&self, service_id: u64) -> StoreResult<()>;

    /// Insert or move the service's acknowledgment deadline
    async fn set_deadline(&self, service_id: u64, deadline: i64) -> StoreResult<()>;

    async fn remove_deadline(&self, service_id: u64) -> StoreResult<()>;

    /// All services whose deadline score is ≤ `now`
    async fn expired_deadlines(&self, now: i64) -> StoreResult<Vec<u64>>;

    /// Cheap liveness probe, used at startup (fatal on failure)
    async fn ping(&self) -> StoreResult<()>;
}

/// Build a store client from configuration
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn RuntimeStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StoreConfig::Redis { url, prefix } => {
            let store = self::redis::RedisStore::connect(url, prefix.clone()).await?;
            Ok(Arc::new(store))
        }
    }
}
