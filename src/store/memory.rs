//! In-memory runtime store (no persistence)
//!
//! Useful for testing without a Redis dependency and for the all-in-one
//! binary. State is lost on restart, so escalation in flight does not
//! survive a crash; real deployments use the Redis backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ServiceStatus;

use super::{IncidentRecord, IncidentState, RuntimeStore, StoreResult};

#[derive(Debug, Default)]
struct Inner {
    status: HashMap<u64, ServiceStatus>,
    down_since: HashMap<u64, i64>,
    incidents: HashMap<u64, IncidentRecord>,
    deadlines: HashMap<u64, i64>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStore for MemoryStore {
    async fn set_status(&self, service_id: u64, status: ServiceStatus) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .status
            .insert(service_id, status);
        Ok(())
    }

    async fn status(&self, service_id: u64) -> StoreResult<Option<ServiceStatus>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .status
            .get(&service_id)
            .copied())
    }

    async fn down_since(&self, service_id: u64) -> StoreResult<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .down_since
            .get(&service_id)
            .copied())
    }

    async fn set_down_since(&self, service_id: u64, epoch: i64) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .down_since
            .insert(service_id, epoch);
        Ok(())
    }

    async fn clear_down_since(&self, service_id: u64) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .down_since
            .remove(&service_id);
        Ok(())
    }

    async fn create_incident(&self, record: &IncidentRecord) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.incidents.contains_key(&record.service_id) {
            return Ok(false);
        }
        inner.incidents.insert(record.service_id, record.clone());
        Ok(true)
    }

    async fn incident(&self, service_id: u64) -> StoreResult<Option<IncidentRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .incidents
            .get(&service_id)
            .cloned())
    }

    async fn set_incident_state(&self, service_id: u64, state: IncidentState) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(record) = inner.incidents.get_mut(&service_id) {
            record.state = state;
        }
        Ok(())
    }

    async fn clear_incident(&self, service_id: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.incidents.remove(&service_id);
        inner.down_since.remove(&service_id);
        Ok(())
    }

    async fn purge_service(&self, service_id: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.incidents.remove(&service_id);
        inner.down_since.remove(&service_id);
        inner.status.remove(&service_id);
        inner.deadlines.remove(&service_id);
        Ok(())
    }

    async fn set_deadline(&self, service_id: u64, deadline: i64) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .deadlines
            .insert(service_id, deadline);
        Ok(())
    }

    async fn remove_deadline(&self, service_id: u64) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .deadlines
            .remove(&service_id);
        Ok(())
    }

    async fn expired_deadlines(&self, now: i64) -> StoreResult<Vec<u64>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let mut expired: Vec<(i64, u64)> = inner
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();

        // Same order a sorted-set range scan would produce
        expired.sort_unstable();
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
