//! In-memory service catalog
//!
//! Both the scheduler and the incident manager keep a local copy of the
//! authoritative service catalog, hydrated once at startup via RPC and kept
//! live by the service CRUD event stream. Rows are immutable snapshots:
//! readers copy a row out under the lock and release it before doing any I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

/// Alerting attributes of a monitored service (the incident manager's view)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub service_id: u64,

    /// Minimum sustained DOWN duration before an incident opens, in seconds
    pub alert_window: u64,

    /// Per-escalation-level acknowledgment budget, in minutes
    pub allowed_response_time: u64,

    /// First entry is required; a second entry, when present, is the
    /// escalation target
    pub oncallers: Vec<String>,
}

impl CatalogEntry {
    pub fn first_oncaller(&self) -> Option<&str> {
        self.oncallers.first().map(String::as_str)
    }

    /// Empty string when no second on-caller is configured (the incident
    /// hash stores it that way)
    pub fn second_oncaller(&self) -> &str {
        self.oncallers.get(1).map(String::as_str).unwrap_or("")
    }
}

/// Probing attributes of a monitored service (the scheduler's view)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleEntry {
    pub service_id: u64,

    pub url: String,

    /// Probe period in seconds
    pub health_check_interval: u64,
}

/// Mutex-guarded `service_id → row` mapping
///
/// The lock is never held across an await point; handlers snapshot the row
/// they need and drop the guard.
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: Mutex<HashMap<u64, CatalogEntry>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole catalog (startup hydration)
    pub fn hydrate(&self, entries: Vec<CatalogEntry>) {
        let mut services = self.services.lock().expect("catalog mutex poisoned");
        services.clear();
        for entry in entries {
            services.insert(entry.service_id, entry);
        }
    }

    pub fn get(&self, service_id: u64) -> Option<CatalogEntry> {
        self.services
            .lock()
            .expect("catalog mutex poisoned")
            .get(&service_id)
            .cloned()
    }

    pub fn upsert(&self, entry: CatalogEntry) {
        self.services
            .lock()
            .expect("catalog mutex poisoned")
            .insert(entry.service_id, entry);
    }

    pub fn remove(&self, service_id: u64) -> Option<CatalogEntry> {
        self.services
            .lock()
            .expect("catalog mutex poisoned")
            .remove(&service_id)
    }

    pub fn len(&self) -> usize {
        self.services.lock().expect("catalog mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
