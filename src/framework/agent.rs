use crate::domain::errors::PipelineError;
use crate::messaging::{Delivery, DiagnosticEvent, Envelope, MessageBus, Payload, SCHEMA_VERSION, Topic};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long a graceful shutdown waits for in-flight handlers.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Consumer task restarts allowed after invariant crashes before the agent
/// gives up on the topic and reports `agent_error`.
const MAX_TASK_RESTARTS: u32 = 3;

/// A long-lived pipeline agent: a name, subscribed topics with a handler,
/// and an optional periodic job. The runner supplies the task plumbing.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn subscriptions(&self) -> Vec<Topic> {
        Vec::new()
    }

    /// Interval of the periodic job, if the agent has one.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Per-message handler deadline.
    fn handler_deadline(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// When false, each delivery is handled in its own task and a topic may
    /// have several handlers in flight. Default is serial delivery, which is
    /// what the ordering-sensitive pipeline stages rely on.
    fn serial_delivery(&self) -> bool {
        true
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError>;

    /// Body of the periodic job. Ticks never overlap: the next tick is
    /// skipped while the previous one is still running.
    async fn tick(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Owns the running tasks of one agent.
pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentRunner {
    pub async fn spawn(agent: Arc<dyn Agent>, bus: Arc<dyn MessageBus>) -> anyhow::Result<Self> {
        agent
            .initialize()
            .await
            .with_context(|| format!("{} failed to initialize", agent.name()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for topic in agent.subscriptions() {
            tasks.push(tokio::spawn(consume_supervised(
                agent.clone(),
                bus.clone(),
                topic,
                shutdown_rx.clone(),
            )));
        }

        if let Some(interval) = agent.tick_interval() {
            tasks.push(tokio::spawn(periodic_loop(
                agent.clone(),
                interval,
                shutdown_rx.clone(),
            )));
        }

        info!("{} started ({} task(s))", agent.name(), tasks.len());
        Ok(Self {
            agent,
            shutdown_tx,
            tasks,
        })
    }

    /// Graceful shutdown: stop consuming, drain in-flight handlers within the
    /// deadline, then force-cancel stragglers.
    pub async fn shutdown(self) {
        let name = self.agent.name();
        let _ = self.shutdown_tx.send(true);

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("{}: shutdown deadline exceeded; tasks force-cancelled", name);
        }

        self.agent.shutdown().await;
        info!("{} stopped", name);
    }
}

/// Consumer loop with a bounded crash loop: an invariant violation kills the
/// task, the supervisor re-subscribes and restarts it up to MAX_TASK_RESTARTS.
async fn consume_supervised(
    agent: Arc<dyn Agent>,
    bus: Arc<dyn MessageBus>,
    topic: Topic,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut restarts = 0u32;
    loop {
        let crashed = consume_topic(&agent, &bus, &topic, shutdown_rx.clone()).await;
        if !crashed || *shutdown_rx.borrow() {
            return;
        }
        restarts += 1;
        if restarts > MAX_TASK_RESTARTS {
            error!(
                "{}: consumer for {} exceeded {} restarts; giving up",
                agent.name(),
                topic,
                MAX_TASK_RESTARTS
            );
            let _ = bus
                .publish(
                    &Topic::Diagnostics,
                    Payload::Diagnostic(DiagnosticEvent {
                        agent: agent.name().to_string(),
                        kind: "agent_error".to_string(),
                        detail: format!("consumer for {} crashed {} times", topic, restarts),
                    }),
                    agent.name(),
                )
                .await;
            return;
        }
        warn!(
            "{}: restarting consumer for {} (restart {}/{})",
            agent.name(),
            topic,
            restarts,
            MAX_TASK_RESTARTS
        );
    }
}

/// Runs one subscription until shutdown or crash. Returns true if the loop
/// ended because of an invariant violation.
async fn consume_topic(
    agent: &Arc<dyn Agent>,
    bus: &Arc<dyn MessageBus>,
    topic: &Topic,
    mut shutdown_rx: watch::Receiver<bool>,
) -> bool {
    let mut rx = bus.subscribe(topic, agent.name()).await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return false,
            maybe = rx.recv() => {
                let Some(delivery) = maybe else { return false };
                if delivery.envelope.schema_version != SCHEMA_VERSION {
                    warn!(
                        "{}: message {} on {} has schema v{}, expected v{}",
                        agent.name(),
                        delivery.envelope.message_id,
                        topic,
                        delivery.envelope.schema_version,
                        SCHEMA_VERSION
                    );
                    delivery.reject().await;
                    continue;
                }

                if agent.serial_delivery() {
                    if handle_delivery(agent, delivery).await {
                        return true;
                    }
                } else {
                    let agent = agent.clone();
                    tokio::spawn(async move {
                        handle_delivery(&agent, delivery).await;
                    });
                }
            }
        }
    }
}

/// Dispatches one delivery and resolves it according to the error taxonomy.
/// Returns true when the agent task must crash (invariant violation).
async fn handle_delivery(agent: &Arc<dyn Agent>, delivery: Delivery) -> bool {
    let message_id = delivery.envelope.message_id;
    let outcome =
        tokio::time::timeout(agent.handler_deadline(), agent.handle(delivery.envelope.clone())).await;

    match outcome {
        Ok(Ok(())) => {
            delivery.ack().await;
            false
        }
        Ok(Err(PipelineError::Transient(reason))) => {
            warn!(
                "{}: transient failure on {} (attempt {}): {}",
                agent.name(),
                message_id,
                delivery.attempt,
                reason
            );
            delivery.nack().await;
            false
        }
        Ok(Err(PipelineError::RateLimited(hint))) => {
            if let Some(delay) = hint {
                tokio::time::sleep(delay).await;
            }
            delivery.nack().await;
            false
        }
        Ok(Err(PipelineError::Contract(reason))) => {
            warn!("{}: contract violation on {}: {}", agent.name(), message_id, reason);
            delivery.reject().await;
            false
        }
        Ok(Err(PipelineError::Rejected(reason))) => {
            // Domain rejections are recorded by the handler; the message is done.
            info!("{}: rejected {}: {}", agent.name(), message_id, reason);
            delivery.ack().await;
            false
        }
        Ok(Err(PipelineError::Invariant(reason))) => {
            error!(
                "{}: invariant violation handling {}: {}",
                agent.name(),
                message_id,
                reason
            );
            delivery.nack().await;
            true
        }
        Err(_elapsed) => {
            warn!(
                "{}: handler deadline exceeded for {} (attempt {})",
                agent.name(),
                message_id,
                delivery.attempt
            );
            delivery.nack().await;
            false
        }
    }
}

/// Periodic job loop. Ticks are awaited inline so they can never overlap;
/// missed ticks are skipped and an overrun is logged.
async fn periodic_loop(agent: Arc<dyn Agent>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {
                let started = tokio::time::Instant::now();
                if let Err(e) = agent.tick().await {
                    warn!("{}: periodic job failed: {:#}", agent.name(), e);
                }
                let elapsed = started.elapsed();
                if elapsed > interval {
                    warn!(
                        "{}: periodic job overran its interval ({:?} > {:?}); next tick skipped",
                        agent.name(),
                        elapsed,
                        interval
                    );
                }
            }
        }
    }
}
