//! Redis Streams broker
//!
//! One stream per topic; consumer groups give load sharing within a
//! component fleet and independent cursors across components. A stream is
//! totally ordered, which subsumes the per-key ordering guarantee.
//!
//! Delivery is at-least-once:
//!
//! - an acked delivery is `XACK`ed and leaves the group's pending list
//! - a nacked delivery is retried locally after a short backoff and stays
//!   pending until some attempt acks it
//! - a consumer that restarts drains its pending backlog (`XREADGROUP` from
//!   id `0`) before reading new entries

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Acker, Broker, BrokerError, BrokerResult, Delivery, Subscription};

/// Entries fetched per XREADGROUP call
const READ_BATCH: usize = 16;

/// How long a read blocks waiting for new entries, in milliseconds
const BLOCK_MS: usize = 5_000;

/// Pause before a nacked entry is offered again
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(500);

/// Pause after a failed read before retrying
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Stable per-host consumer name, so a restarted process finds its own
/// pending backlog again. Falls back to the pid where no hostname is set.
fn consumer_name(group: &str) -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => format!("{group}@{host}"),
        _ => format!("{group}-{}", std::process::id()),
    }
}

#[derive(Debug, Clone)]
struct StreamEntry {
    id: String,
    ordering_key: String,
    payload: Vec<u8>,
    attempt: u32,
}

/// Broker backed by Redis Streams
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, ordering_key: &str, payload: &[u8]) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd(
                topic,
                "*",
                &[("key", ordering_key.as_bytes()), ("data", payload)],
            )
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut conn = self.conn.clone();

        let created: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(topic, group, "0").await;

        match created {
            Ok(_) => debug!("created consumer group {group} on {topic}"),
            // The group surviving across restarts is the normal case
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(BrokerError::SubscribeFailed(e.to_string())),
        }

        let (redelivery_tx, redelivery_rx) = mpsc::unbounded_channel();

        Ok(Box::new(RedisSubscription {
            conn: self.conn.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer_name(group),
            backlog_cursor: Some("0".to_string()),
            buffer: VecDeque::new(),
            redelivery_rx,
            redelivery_tx,
        }))
    }
}

struct RedisSubscription {
    conn: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,

    /// While `Some`, reads resume from this id in the group's pending list
    /// (crash recovery); once the backlog is drained, reads switch to `>`
    backlog_cursor: Option<String>,

    buffer: VecDeque<StreamEntry>,
    redelivery_rx: mpsc::UnboundedReceiver<StreamEntry>,
    redelivery_tx: mpsc::UnboundedSender<StreamEntry>,
}

impl RedisSubscription {
    fn wrap(&self, entry: StreamEntry) -> Delivery {
        let acker = RedisAcker {
            conn: self.conn.clone(),
            topic: self.topic.clone(),
            group: self.group.clone(),
            redelivery_tx: self.redelivery_tx.clone(),
            entry: entry.clone(),
        };
        Delivery::new(
            entry.ordering_key,
            entry.payload,
            entry.attempt,
            Box::new(acker),
        )
    }

    /// Read one batch into the buffer; returns the ids seen
    async fn read_batch(&mut self) -> BrokerResult<Vec<String>> {
        let from_backlog = self.backlog_cursor.is_some();
        let cursor = self
            .backlog_cursor
            .clone()
            .unwrap_or_else(|| ">".to_string());

        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH);
        if !from_backlog {
            options = options.block(BLOCK_MS);
        }

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[self.topic.as_str()], &[cursor.as_str()], &options)
            .await?;

        let mut seen = Vec::new();
        for stream_key in reply.keys {
            for raw in stream_key.ids {
                seen.push(raw.id.clone());

                let key: Option<String> = raw.get("key");
                let data: Option<Vec<u8>> = raw.get("data");

                match (key, data) {
                    (Some(ordering_key), Some(payload)) => self.buffer.push_back(StreamEntry {
                        id: raw.id,
                        ordering_key,
                        payload,
                        attempt: 1,
                    }),
                    _ => {
                        // Entries not produced by this platform cannot be
                        // handled; acking keeps the pending list clean
                        warn!("malformed stream entry {} on {}, dropping", raw.id, self.topic);
                        let _: redis::RedisResult<u64> = conn
                            .xack(self.topic.as_str(), self.group.as_str(), &[raw.id.as_str()])
                            .await;
                    }
                }
            }
        }

        Ok(seen)
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            // Local redeliveries first, then buffered reads
            if let Ok(entry) = self.redelivery_rx.try_recv() {
                return Some(self.wrap(entry));
            }
            if let Some(entry) = self.buffer.pop_front() {
                return Some(self.wrap(entry));
            }

            match self.read_batch().await {
                Ok(seen) => {
                    if let Some(cursor) = &mut self.backlog_cursor {
                        match seen.last() {
                            // Advance past what we just claimed so buffered
                            // entries are not fetched twice
                            Some(last) => *cursor = last.clone(),
                            None => {
                                debug!(
                                    "backlog drained for {} group {}",
                                    self.topic, self.group
                                );
                                self.backlog_cursor = None;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read from {} failed: {e}", self.topic);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    }
}

struct RedisAcker {
    conn: ConnectionManager,
    topic: String,
    group: String,
    redelivery_tx: mpsc::UnboundedSender<StreamEntry>,
    entry: StreamEntry,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) {
        let mut conn = self.conn.clone();
        let acked: redis::RedisResult<u64> = conn
            .xack(
                self.topic.as_str(),
                self.group.as_str(),
                &[self.entry.id.as_str()],
            )
            .await;

        if let Err(e) = acked {
            // The entry stays pending and will be redelivered after restart
            warn!("failed to ack {} on {}: {e}", self.entry.id, self.topic);
        }
    }

    async fn nack(mut self: Box<Self>) {
        tokio::time::sleep(REDELIVERY_BACKOFF).await;
        self.entry.attempt += 1;
        let _ = self.redelivery_tx.send(self.entry);
    }
}
