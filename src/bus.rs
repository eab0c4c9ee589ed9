//! Event bus contract and an in-process default transport.
//!
//! The bus is the seam between durable, networked transports (Kafka/NATS/
//! SQS in a production deployment) and the synchronous test harness here.
//! `InMemoryEventBus` is topic-routed, supports multiple consumer groups
//! per topic (each group sees every message, mirroring a durable bus's
//! consumer-group semantics), and tracks per-message delivery counts so
//! dead-lettering after `MAX_DELIVERIES` attempts can be exercised in
//! tests, including duplicate redelivery of the same message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::model::EventEnvelope;

/// Durable, topic-routed, at-least-once event transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an envelope to `topic`. `key` is the grouping key (the
    /// pipeline always uses `batch_id`); ordering across keys is not
    /// guaranteed.
    async fn publish(&self, topic: &str, key: &str, envelope: EventEnvelope) -> Result<()>;

    /// Subscribe `group` to `topic`, returning a receiver of envelopes.
    /// Every envelope on the topic is delivered to every distinct group.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<mpsc::Receiver<EventEnvelope>>;
}

struct TopicState {
    /// One sender per `(group)` subscribed to this topic.
    senders: HashMap<String, mpsc::Sender<EventEnvelope>>,
    /// Envelopes that exceeded `max_deliveries` redeliveries, parked here
    /// for operator inspection.
    dead_letters: Vec<EventEnvelope>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            senders: HashMap::new(),
            dead_letters: Vec::new(),
        }
    }
}

/// In-process event bus backed by `tokio::sync::mpsc` channels, one per
/// `(topic, group)` pair.
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, TopicState>>,
    channel_capacity: usize,
    max_deliveries: u32,
}

impl InMemoryEventBus {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            channel_capacity: 1_024,
            max_deliveries,
        }
    }

    /// Build a bus honoring `config.max_deliveries`, the knob real pipeline
    /// wiring should use instead of [`Default`].
    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        Self::new(config.max_deliveries)
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Number of dead-lettered envelopes parked for `topic`, for tests and
    /// operator diagnostics.
    pub async fn dead_letter_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|t| t.dead_letters.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, _key: &str, mut envelope: EventEnvelope) -> Result<()> {
        if envelope.delivery_count >= self.max_deliveries {
            let mut topics = self.topics.lock().await;
            let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);
            state.dead_letters.push(envelope);
            return Ok(());
        }
        envelope.delivery_count += 1;

        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);

        for sender in state.senders.values() {
            if sender.send(envelope.clone()).await.is_err() {
                // Receiver dropped; that consumer group no longer exists.
                // Not an error for the publisher.
                continue;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<mpsc::Receiver<EventEnvelope>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);
        state.senders.insert(group.to_string(), tx);
        Ok(rx)
    }
}

/// Convenience alias for an [`EventBus`] shared across the pipeline's
/// components.
pub type SharedEventBus = Arc<dyn EventBus>;

/// Deserialize a bus payload defensively, surfacing malformed events as
/// `Error::BusDeserialize` rather than panicking. Callers should log with
/// the event's `correlation_id` and drop rather than ack-then-crash.
pub fn parse_envelope(bytes: &[u8]) -> Result<EventEnvelope> {
    serde_json::from_slice(bytes).map_err(|e| Error::BusDeserialize(e.to_string()))
}
