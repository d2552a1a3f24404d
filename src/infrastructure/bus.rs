//! In-process message bus satisfying the broker contract: topic-addressed
//! delivery, per-consumer-group FIFO queues, at-least-once with bounded
//! redelivery, and a per-topic dead-letter queue.

use crate::domain::errors::BusError;
use crate::messaging::{Delivery, Envelope, MessageBus, Payload, RedeliveryHook, Topic};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::warn;

const DEFAULT_MAX_REDELIVERIES: u32 = 4;
const PUBLISH_DEADLINE: Duration = Duration::from_secs(2);
const QUEUE_CAPACITY: usize = 256;

struct GroupSub {
    group: String,
    tx: Sender<Delivery>,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<GroupSub>,
    dead_letters: Vec<Envelope>,
}

struct BusCore {
    topics: RwLock<HashMap<String, TopicState>>,
    max_redeliveries: u32,
    weak_self: Weak<BusCore>,
}

impl BusCore {
    fn hook(&self) -> Arc<dyn RedeliveryHook> {
        // The core is only reachable through its owning Arc.
        self.weak_self
            .upgrade()
            .map(|arc| arc as Arc<dyn RedeliveryHook>)
            .unwrap_or_else(|| unreachable!("bus core outlived its Arc"))
    }
}

#[async_trait]
impl RedeliveryHook for BusCore {
    async fn redeliver(&self, topic: &str, group: &str, envelope: Envelope, attempt: u32) {
        // `attempt` deliveries have already happened; past the budget the
        // message counts as poison.
        if attempt > self.max_redeliveries {
            warn!(
                "Bus: message {} on {} exhausted {} redeliveries; dead-lettering",
                envelope.message_id, topic, self.max_redeliveries
            );
            self.dead_letter(topic, envelope).await;
            return;
        }

        let tx = {
            let topics = self.topics.read().await;
            let Some(state) = topics.get(topic) else { return };
            let Some(sub) = state.subscribers.iter().find(|s| s.group == group) else {
                return;
            };
            sub.tx.clone()
        };
        let delivery = Delivery::new(
            envelope,
            attempt + 1,
            topic.to_string(),
            group.to_string(),
            self.hook(),
        );
        // The nacking consumer is the one that must drain this queue; a
        // blocking send here could wait on ourselves. Push from a side task
        // when the queue is full.
        if let Err(mpsc::error::TrySendError::Full(delivery)) = tx.try_send(delivery) {
            tokio::spawn(async move {
                let _ = tx.send(delivery).await;
            });
        }
    }

    async fn dead_letter(&self, topic: &str, envelope: Envelope) {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .dead_letters
            .push(envelope);
    }
}

/// The in-memory broker. Cloning shares the underlying queues.
#[derive(Clone)]
pub struct InMemoryBus {
    core: Arc<BusCore>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        let core = Arc::new_cyclic(|weak| BusCore {
            topics: RwLock::new(HashMap::new()),
            max_redeliveries,
            weak_self: weak.clone(),
        });
        Self { core }
    }

    /// Dead-lettered envelopes for a topic, oldest first. Test observability.
    pub async fn dead_letters(&self, topic: &Topic) -> Vec<Envelope> {
        let topics = self.core.topics.read().await;
        topics
            .get(&topic.name())
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &Topic,
        payload: Payload,
        source_agent: &str,
    ) -> Result<(), BusError> {
        let envelope = Envelope::new(source_agent, payload);
        let name = topic.name();

        let topics = self.core.topics.read().await;
        let Some(state) = topics.get(&name) else {
            // No consumers yet; at-least-once starts at subscription time.
            return Ok(());
        };

        for sub in &state.subscribers {
            let delivery = Delivery::new(
                envelope.clone(),
                1,
                name.clone(),
                sub.group.clone(),
                self.core.hook(),
            );
            match tokio::time::timeout(PUBLISH_DEADLINE, sub.tx.send(delivery)).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => {
                    // Receiver dropped; the subscription is pruned lazily on
                    // the next subscribe call.
                }
                Err(_elapsed) => {
                    return Err(BusError::PublishTimeout {
                        topic: name,
                        deadline: PUBLISH_DEADLINE,
                    });
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic, group: &str) -> Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut topics = self.core.topics.write().await;
        let state = topics.entry(topic.name()).or_default();
        // A re-subscribing group (consumer task restart) replaces its queue;
        // closed queues are dropped along the way.
        state
            .subscribers
            .retain(|s| s.group != group && !s.tx.is_closed());
        state.subscribers.push(GroupSub {
            group: group.to_string(),
            tx,
        });
        rx
    }

    async fn dead_letter_count(&self, topic: &Topic) -> u64 {
        let topics = self.core.topics.read().await;
        topics
            .get(&topic.name())
            .map(|s| s.dead_letters.len() as u64)
            .unwrap_or(0)
    }
}
