use crate::domain::errors::BusError;
use crate::messaging::envelope::{Envelope, Payload, Topic};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::warn;

/// Contract of the message broker: topic-addressed, at-least-once, persistent
/// queues with per-topic dead-letters. The broker itself is an external
/// collaborator; the in-process implementation in `infrastructure::bus`
/// satisfies this contract for tests and paper trading.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Wraps `payload` in a fresh envelope and delivers it to every consumer
    /// group subscribed to `topic`.
    async fn publish(&self, topic: &Topic, payload: Payload, source_agent: &str)
    -> Result<(), BusError>;

    /// Subscribes a consumer group to a topic. Messages are delivered in
    /// publish order per group; each delivery must be acked, nacked, or
    /// rejected.
    async fn subscribe(&self, topic: &Topic, group: &str) -> Receiver<Delivery>;

    /// Number of messages dead-lettered on a topic.
    async fn dead_letter_count(&self, topic: &Topic) -> u64;
}

/// Redelivery callbacks a delivery uses to resolve itself. Implemented by the
/// bus; handlers only see [`Delivery`].
#[async_trait]
pub trait RedeliveryHook: Send + Sync {
    /// Re-enqueues the message for the group, or dead-letters it when the
    /// redelivery budget is exhausted.
    async fn redeliver(&self, topic: &str, group: &str, envelope: Envelope, attempt: u32);

    async fn dead_letter(&self, topic: &str, envelope: Envelope);
}

/// One message handed to a consumer. At-least-once semantics: the message is
/// considered in-flight until one of the consuming methods runs.
pub struct Delivery {
    pub envelope: Envelope,
    /// 1-based delivery attempt for this group.
    pub attempt: u32,
    pub(crate) topic: String,
    pub(crate) group: String,
    pub(crate) hook: Arc<dyn RedeliveryHook>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        attempt: u32,
        topic: String,
        group: String,
        hook: Arc<dyn RedeliveryHook>,
    ) -> Self {
        Self {
            envelope,
            attempt,
            topic,
            group,
            hook,
        }
    }

    /// Handling succeeded; the message leaves the queue.
    pub async fn ack(self) {}

    /// Handling failed transiently; redeliver (or dead-letter once the
    /// attempt budget is spent).
    pub async fn nack(self) {
        self.hook
            .redeliver(&self.topic, &self.group, self.envelope, self.attempt)
            .await;
    }

    /// The message violates its contract; route it straight to the topic's
    /// dead-letter queue without burning redelivery attempts.
    pub async fn reject(self) {
        warn!(
            "Bus: rejecting message {} on {} (contract violation)",
            self.envelope.message_id, self.topic
        );
        self.hook.dead_letter(&self.topic, self.envelope).await;
    }
}
