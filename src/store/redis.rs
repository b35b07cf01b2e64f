//! Redis runtime store
//!
//! Single round trips for the simple keys, a Lua script for the
//! create-incident CAS, and `MULTI`/`EXEC` pipelines for the paired
//! deletions. All commands go through a shared [`ConnectionManager`] that
//! reconnects on its own.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::ServiceStatus;

use super::{keys, IncidentRecord, IncidentState, RuntimeStore, StoreError, StoreResult};

/// Creates the incident hash only when the key does not exist yet.
/// Returns 1 when created, 0 when an incident was already present.
const CREATE_INCIDENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1],
    'incident_id', ARGV[1],
    'service_id', ARGV[2],
    'state', ARGV[3],
    'incident_start_time', ARGV[4],
    'allowed_response_time', ARGV[5],
    'first_oncaller', ARGV[6],
    'second_oncaller', ARGV[7])
return 1
"#;

/// Store backed by Redis
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: String) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { conn, prefix })
    }
}

#[async_trait]
impl RuntimeStore for RedisStore {
    async fn set_status(&self, service_id: u64, status: ServiceStatus) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::status(service_id), status.as_str()).await?;
        Ok(())
    }

    async fn status(&self, service_id: u64) -> StoreResult<Option<ServiceStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::status(service_id)).await?;

        match raw {
            None => Ok(None),
            Some(raw) => ServiceStatus::parse(&raw)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status `{raw}`"))),
        }
    }

    async fn down_since(&self, service_id: u64) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let epoch: Option<i64> = conn
            .get(keys::down_since(&self.prefix, service_id))
            .await?;
        Ok(epoch)
    }

    async fn set_down_since(&self, service_id: u64, epoch: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(keys::down_since(&self.prefix, service_id), epoch)
            .await?;
        Ok(())
    }

    async fn clear_down_since(&self, service_id: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::down_since(&self.prefix, service_id)).await?;
        Ok(())
    }

    async fn create_incident(&self, record: &IncidentRecord) -> StoreResult<bool> {
        let mut conn = self.conn.clone();

        let script = Script::new(CREATE_INCIDENT_SCRIPT);
        let created: i64 = script
            .key(keys::incident(&self.prefix, record.service_id))
            .arg(&record.incident_id)
            .arg(record.service_id)
            .arg(record.state.as_str())
            .arg(record.incident_start_time)
            .arg(record.allowed_response_time)
            .arg(&record.first_oncaller)
            .arg(&record.second_oncaller)
            .invoke_async(&mut conn)
            .await?;

        Ok(created == 1)
    }

    async fn incident(&self, service_id: u64) -> StoreResult<Option<IncidentRecord>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(keys::incident(&self.prefix, service_id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        IncidentRecord::from_fields(&fields).map(Some)
    }

    async fn set_incident_state(&self, service_id: u64, state: IncidentState) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                keys::incident(&self.prefix, service_id),
                "state",
                state.as_str(),
            )
            .await?;
        Ok(())
    }

    async fn clear_incident(&self, service_id: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(keys::incident(&self.prefix, service_id))
            .ignore()
            .del(keys::down_since(&self.prefix, service_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge_service(&self, service_id: u64) -> StoreResult<()> {
        debug!("purging runtime keys for service {service_id}");

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(keys::incident(&self.prefix, service_id))
            .ignore()
            .del(keys::down_since(&self.prefix, service_id))
            .ignore()
            .del(keys::status(service_id))
            .ignore()
            .zrem(keys::deadline_set(&self.prefix), service_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_deadline(&self, service_id: u64, deadline: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(keys::deadline_set(&self.prefix), service_id, deadline)
            .await?;
        Ok(())
    }

    async fn remove_deadline(&self, service_id: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(keys::deadline_set(&self.prefix), service_id)
            .await?;
        Ok(())
    }

    async fn expired_deadlines(&self, now: i64) -> StoreResult<Vec<u64>> {
        let mut conn = self.conn.clone();
        let members: Vec<u64> = conn
            .zrangebyscore(keys::deadline_set(&self.prefix), "-inf", now)
            .await?;
        Ok(members)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
