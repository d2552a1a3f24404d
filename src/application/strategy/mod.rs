//! Strategy agent: buffers signals per symbol, fuses them on a periodic
//! cadence, and emits a trade intent when the decision clears the gates.

pub mod fusion;
pub mod reliability;

use crate::domain::errors::PipelineError;
use crate::domain::order::OrderStatusEvent;
use crate::domain::repositories::DecisionRepository;
use crate::domain::signal::{
    FusionMeta, Signal, SignalContribution, SignalKind, StrategyDecision, TradeIntent,
};
use crate::domain::types::OrderSide;
use crate::framework::{Agent, RetryPolicy};
use crate::messaging::{Envelope, MessageBus, Payload, Topic};
use async_trait::async_trait;
use chrono::Utc;
use fusion::{FusionStrategy, HybridWeights};
use reliability::SourceReliability;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Emitted intents we still expect a close outcome for (adaptive weighting).
const PENDING_OUTCOME_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub fusion_strategy: FusionStrategy,
    pub min_signals: usize,
    pub signal_timeout: Duration,
    pub buffer_max: usize,
    pub min_confidence: f64,
    pub decision_interval: Duration,
    /// Minimum spacing between intents per symbol; defaults to the decision
    /// interval.
    pub cooldown: Duration,
    pub min_agreement: f64,
    pub hybrid_weights: HybridWeights,
    pub adaptive_weights: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fusion_strategy: FusionStrategy::Hybrid,
            min_signals: 2,
            signal_timeout: Duration::from_secs(300),
            buffer_max: 50,
            min_confidence: 0.6,
            decision_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            min_agreement: 0.6,
            hybrid_weights: HybridWeights::default(),
            adaptive_weights: false,
        }
    }
}

struct SymbolBuffer {
    signals: VecDeque<Signal>,
    last_intent_at: Option<i64>,
}

struct PendingOutcome {
    action: OrderSide,
    sources: Vec<(String, SignalKind)>,
}

pub struct StrategyAgent {
    config: StrategyConfig,
    bus: Arc<dyn MessageBus>,
    decision_repository: Arc<dyn DecisionRepository>,
    buffers: Mutex<HashMap<String, SymbolBuffer>>,
    reliability: Mutex<SourceReliability>,
    pending: Mutex<VecDeque<(Uuid, PendingOutcome)>>,
    retry: RetryPolicy,
}

impl StrategyAgent {
    pub fn new(
        config: StrategyConfig,
        bus: Arc<dyn MessageBus>,
        decision_repository: Arc<dyn DecisionRepository>,
    ) -> Self {
        Self {
            config,
            bus,
            decision_repository,
            buffers: Mutex::new(HashMap::new()),
            reliability: Mutex::new(SourceReliability::new()),
            pending: Mutex::new(VecDeque::new()),
            retry: RetryPolicy::default(),
        }
    }

    fn prune(&self, buffer: &mut SymbolBuffer, now_ms: i64) {
        let timeout_ms = self.config.signal_timeout.as_millis() as i64;
        buffer
            .signals
            .retain(|s| now_ms - s.emitted_at <= timeout_ms);
        while buffer.signals.len() > self.config.buffer_max {
            buffer.signals.pop_front();
        }
    }

    async fn on_signal(&self, signal: Signal) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&signal.confidence) {
            return Err(PipelineError::Contract(format!(
                "signal {} confidence {} out of [0,1]",
                signal.id, signal.confidence
            )));
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(signal.symbol.clone())
            .or_insert_with(|| SymbolBuffer {
                signals: VecDeque::new(),
                last_intent_at: None,
            });

        // Redelivered signals are deduplicated by id.
        if buffer.signals.iter().any(|s| s.id == signal.id) {
            debug!("Strategy [{}]: duplicate signal {}", signal.symbol, signal.id);
            return Ok(());
        }

        buffer.signals.push_back(signal);
        self.prune(buffer, now_ms);
        Ok(())
    }

    async fn on_order_status(&self, event: OrderStatusEvent) -> Result<(), PipelineError> {
        if !self.config.adaptive_weights {
            return Ok(());
        }
        // Only position-close reports carry a realized PnL.
        let (Some(intent_id), Some(pnl)) = (event.intent_id, event.realized_pnl) else {
            return Ok(());
        };

        let mut pending = self.pending.lock().await;
        let Some(index) = pending.iter().position(|(id, _)| *id == intent_id) else {
            return Ok(());
        };
        let (_, outcome) = pending.remove(index).expect("index just found");
        drop(pending);

        let won = pnl > Decimal::ZERO;
        let mut reliability = self.reliability.lock().await;
        for (source, kind) in &outcome.sources {
            // A source is credited when it voted the traded direction and the
            // trade won, or voted against it and the trade lost.
            let agreed = kind.as_side() == Some(outcome.action);
            if agreed {
                reliability.record(source, won);
            } else if kind.as_side().is_some() {
                reliability.record(source, !won);
            }
        }
        info!(
            "Strategy: recorded outcome for intent {} (pnl {}, {} sources)",
            intent_id,
            pnl,
            outcome.sources.len()
        );
        Ok(())
    }

    /// Runs one fusion decision for a symbol. Returns the emitted intent, if
    /// the gates passed.
    async fn decide(&self, symbol: &str, now_ms: i64) -> Result<Option<TradeIntent>, PipelineError> {
        let mut buffers = self.buffers.lock().await;
        let Some(buffer) = buffers.get_mut(symbol) else {
            return Ok(None);
        };
        self.prune(buffer, now_ms);

        if buffer.signals.len() < self.config.min_signals {
            debug!(
                "Strategy [{}]: {} signal(s) < min_signals {}, decision skipped",
                symbol,
                buffer.signals.len(),
                self.config.min_signals
            );
            return Ok(None);
        }

        let signals: Vec<Signal> = buffer.signals.iter().cloned().collect();
        let cooldown_remaining = buffer.last_intent_at.map(|t| {
            self.config.cooldown.as_millis() as i64 - (now_ms - t)
        });
        drop(buffers);

        let source_weights = if self.config.adaptive_weights {
            self.reliability.lock().await.weights()
        } else {
            HashMap::new()
        };

        let outcome = fusion::fuse(
            self.config.fusion_strategy,
            &signals,
            now_ms,
            self.config.min_agreement,
            self.config.hybrid_weights,
            &source_weights,
        );

        let meta = FusionMeta {
            strategy: self.config.fusion_strategy.as_str().to_string(),
            buffer_size: signals.len(),
            contributing: signals
                .iter()
                .map(|s| SignalContribution {
                    source: s.source.clone(),
                    kind: s.kind,
                    confidence: s.confidence,
                    age_ms: now_ms - s.emitted_at,
                })
                .collect(),
            scores: outcome.scores,
        };

        let in_cooldown = cooldown_remaining.is_some_and(|remaining| remaining > 0);
        let (emitted, reason) = if outcome.action == SignalKind::Hold {
            (false, "hold".to_string())
        } else if outcome.confidence < self.config.min_confidence {
            (false, format!(
                "confidence {:.3} below threshold {:.2}",
                outcome.confidence, self.config.min_confidence
            ))
        } else if in_cooldown {
            (false, "cooldown active".to_string())
        } else {
            (true, "gates passed".to_string())
        };

        let decision = StrategyDecision {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: outcome.action,
            confidence: outcome.confidence,
            emitted,
            reason,
            fusion: meta.clone(),
            created_at: now_ms,
        };
        self.retry
            .run("persist decision", || async {
                self.decision_repository.save(&decision).await
            })
            .await
            .map_err(|e| PipelineError::Transient(format!("decision persist failed: {:#}", e)))?;

        if !emitted {
            debug!(
                "Strategy [{}]: {} at {:.3} not emitted ({})",
                symbol, decision.action, decision.confidence, decision.reason
            );
            return Ok(None);
        }

        let action = match outcome.action.as_side() {
            Some(side) => side,
            None => return Ok(None),
        };
        let expected_price = signals
            .iter()
            .rev()
            .find_map(|s| s.indicators.price)
            .and_then(Decimal::from_f64_retain);
        let Some(expected_price) = expected_price else {
            warn!("Strategy [{}]: no price in buffer, intent suppressed", symbol);
            return Ok(None);
        };

        let intent = TradeIntent {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action,
            confidence: outcome.confidence,
            expected_price,
            fusion: meta,
            created_at: now_ms,
        };

        let mut buffers = self.buffers.lock().await;
        if let Some(buffer) = buffers.get_mut(symbol) {
            buffer.last_intent_at = Some(now_ms);
        }
        drop(buffers);

        if self.config.adaptive_weights {
            let mut pending = self.pending.lock().await;
            if pending.len() == PENDING_OUTCOME_CAP {
                pending.pop_front();
            }
            pending.push_back((
                intent.id,
                PendingOutcome {
                    action,
                    sources: signals.iter().map(|s| (s.source.clone(), s.kind)).collect(),
                },
            ));
        }

        info!(
            "Strategy [{}]: emitting {} intent, confidence {:.3}",
            symbol, intent.action, intent.confidence
        );
        Ok(Some(intent))
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn name(&self) -> &'static str {
        "strategy"
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::SignalsTech, Topic::OrderStatus]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.decision_interval)
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        match envelope.payload {
            Payload::Signal(signal) => self.on_signal(signal).await,
            Payload::OrderStatus(event) => self.on_order_status(event).await,
            other => Err(PipelineError::Contract(format!(
                "unexpected payload for strategy: {:?}",
                other
            ))),
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let symbols: Vec<String> = {
            let buffers = self.buffers.lock().await;
            buffers.keys().cloned().collect()
        };

        for symbol in symbols {
            match self.decide(&symbol, now_ms).await {
                Ok(Some(intent)) => {
                    self.bus
                        .publish(&Topic::TradeIntent, Payload::Intent(intent), self.name())
                        .await?;
                }
                Ok(None) => {}
                Err(e) => warn!("Strategy [{}]: decision failed: {}", symbol, e),
            }
        }
        Ok(())
    }
}
