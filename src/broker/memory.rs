//! In-process broker
//!
//! Backs the all-in-one binary and the test suite. Each `(topic, group)`
//! pair owns an unbounded queue; publishing fans a message out to every
//! group subscribed to the topic. Within a group there is a single consumer,
//! so per-key ordering degenerates to total order per topic.
//!
//! A nacked delivery is requeued on a redelivery channel that the
//! subscription drains ahead of fresh messages, after a short backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Acker, Broker, BrokerResult, Delivery, Subscription};

/// Pause before a nacked message is offered again
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct QueuedMessage {
    ordering_key: String,
    payload: Vec<u8>,
    attempt: u32,
}

/// Broker backed by tokio channels
#[derive(Default)]
pub struct InProcessBroker {
    /// topic → group → queue
    topics: Mutex<HashMap<String, HashMap<String, mpsc::UnboundedSender<QueuedMessage>>>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn publish(&self, topic: &str, ordering_key: &str, payload: &[u8]) -> BrokerResult<()> {
        let message = QueuedMessage {
            ordering_key: ordering_key.to_string(),
            payload: payload.to_vec(),
            attempt: 1,
        };

        let mut topics = self.topics.lock().expect("broker mutex poisoned");
        let Some(groups) = topics.get_mut(topic) else {
            trace!("no subscribers on topic {topic}, dropping message");
            return Ok(());
        };

        // Senders whose subscription was dropped are pruned as we go
        groups.retain(|_, sender| sender.send(message.clone()).is_ok());

        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (redelivery_tx, redelivery_rx) = mpsc::unbounded_channel();

        let mut topics = self.topics.lock().expect("broker mutex poisoned");
        let groups = topics.entry(topic.to_string()).or_default();

        // A group has a single consumer; a second subscribe takes over
        if groups.insert(group.to_string(), tx).is_some() {
            trace!("group {group} resubscribed on topic {topic}");
        }

        Ok(Box::new(MemorySubscription {
            rx,
            redelivery_rx,
            redelivery_tx,
        }))
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<QueuedMessage>,
    redelivery_rx: mpsc::UnboundedReceiver<QueuedMessage>,
    redelivery_tx: mpsc::UnboundedSender<QueuedMessage>,
}

impl MemorySubscription {
    fn wrap(&self, message: QueuedMessage) -> Delivery {
        let acker = MemoryAcker {
            redelivery_tx: self.redelivery_tx.clone(),
            message: message.clone(),
        };
        Delivery::new(
            message.ordering_key,
            message.payload,
            message.attempt,
            Box::new(acker),
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        // Redeliveries go first so a retried message keeps its place
        // ahead of anything published after it
        if let Ok(message) = self.redelivery_rx.try_recv() {
            return Some(self.wrap(message));
        }

        tokio::select! {
            biased;

            Some(message) = self.redelivery_rx.recv() => Some(self.wrap(message)),

            message = self.rx.recv() => message.map(|m| self.wrap(m)),
        }
    }
}

struct MemoryAcker {
    redelivery_tx: mpsc::UnboundedSender<QueuedMessage>,
    message: QueuedMessage,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) {}

    async fn nack(mut self: Box<Self>) {
        tokio::time::sleep(REDELIVERY_BACKOFF).await;
        self.message.attempt += 1;
        // Receiver gone means the subscription ended; nothing to redeliver to
        let _ = self.redelivery_tx.send(self.message);
    }
}
