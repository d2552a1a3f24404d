//! RiskManager agent: sizes each trade intent, validates it through five
//! ordered layers, and reserves funds atomically so concurrent intents can
//! never overcommit the account.

pub mod sizing;
pub mod stops;
pub mod validators;

use crate::domain::errors::PipelineError;
use crate::domain::order::{OrderStatus, OrderStatusEvent, ValidatedOrder};
use crate::domain::ports::{CandleStore, ExchangeAdapter, ExchangeInfo};
use crate::domain::position::Position;
use crate::domain::repositories::{AssessmentRepository, PositionRepository};
use crate::domain::risk::{RejectReason, RiskAssessment};
use crate::domain::signal::TradeIntent;
use crate::domain::types::{Candle, Timeframe};
use crate::framework::{Agent, RetryPolicy};
use crate::messaging::{Envelope, MessageBus, Payload, Topic};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sizing::{Sizing, SizingConfig};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::sync::Arc;
use stops::{StopConfig, StopLevels};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use validators::{ValidationContext, ValidationPipeline, cluster_of};

/// Candles pulled from the store for ATR and return-volatility inputs.
const INPUT_CANDLES: usize = 60;

/// Price of last resort when both the store and the intent are silent.
const FALLBACK_PRICE: Decimal = Decimal::ONE;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Exchange tag stamped on positions, used for the one-open-position key.
    pub exchange: String,
    pub timeframe: Timeframe,
    pub min_confidence: f64,
    pub min_rr: Decimal,
    pub max_risk_per_trade_pct: Decimal,
    pub max_portfolio_risk_pct: Decimal,
    pub cluster_risk_cap_pct: Decimal,
    pub sizing: SizingConfig,
    pub stop: StopConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            exchange: "paper".to_string(),
            timeframe: Timeframe::M1,
            min_confidence: 0.6,
            min_rr: dec!(1.5),
            max_risk_per_trade_pct: dec!(0.01),
            max_portfolio_risk_pct: dec!(0.20),
            cluster_risk_cap_pct: dec!(0.05),
            sizing: SizingConfig::default(),
            stop: StopConfig::default(),
        }
    }
}

/// The single source of truth on spendable funds. Everything that reads or
/// writes (balance, reservations) goes through the owning mutex.
#[derive(Debug, Default)]
pub struct BalanceBook {
    pub account_balance: Decimal,
    reservations: HashMap<Uuid, Decimal>,
}

impl BalanceBook {
    pub fn new(account_balance: Decimal) -> Self {
        Self {
            account_balance,
            reservations: HashMap::new(),
        }
    }

    pub fn reserved_total(&self) -> Decimal {
        self.reservations.values().copied().sum()
    }

    pub fn available(&self) -> Decimal {
        self.account_balance - self.reserved_total()
    }

    pub fn reserve(&mut self, order_id: Uuid, amount: Decimal) -> Result<(), RejectReason> {
        if self.available() < amount {
            return Err(RejectReason::InsufficientAvailableBalance);
        }
        self.reservations.insert(order_id, amount);
        Ok(())
    }

    /// FILLED: the reservation converts into spent balance, exactly once.
    pub fn settle_filled(&mut self, order_id: Uuid) {
        if let Some(amount) = self.reservations.remove(&order_id) {
            self.account_balance -= amount;
        }
    }

    /// Any other terminal status: the hold is released, balance untouched.
    pub fn release(&mut self, order_id: Uuid) {
        self.reservations.remove(&order_id);
    }
}

pub struct RiskManager {
    config: RiskConfig,
    bus: Arc<dyn MessageBus>,
    exchange: Arc<dyn ExchangeAdapter>,
    candle_store: Arc<dyn CandleStore>,
    assessments: Arc<dyn AssessmentRepository>,
    positions: Arc<dyn PositionRepository>,
    pipeline: ValidationPipeline,
    book: Mutex<BalanceBook>,
    retry: RetryPolicy,
}

impl RiskManager {
    pub fn new(
        config: RiskConfig,
        bus: Arc<dyn MessageBus>,
        exchange: Arc<dyn ExchangeAdapter>,
        candle_store: Arc<dyn CandleStore>,
        assessments: Arc<dyn AssessmentRepository>,
        positions: Arc<dyn PositionRepository>,
    ) -> Self {
        let pipeline = ValidationPipeline::standard(
            config.min_confidence,
            config.min_rr,
            config.max_risk_per_trade_pct,
            config.max_portfolio_risk_pct,
            config.cluster_risk_cap_pct,
        );
        Self {
            config,
            bus,
            exchange,
            candle_store,
            assessments,
            positions,
            pipeline,
            book: Mutex::new(BalanceBook::default()),
            retry: RetryPolicy::default(),
        }
    }

    /// Current book state for tests and snapshots.
    pub async fn book_state(&self) -> (Decimal, Decimal) {
        let book = self.book.lock().await;
        (book.account_balance, book.reserved_total())
    }

    async fn persist_assessment(&self, assessment: &RiskAssessment) -> Result<(), PipelineError> {
        self.retry
            .run("persist assessment", || async {
                self.assessments.save(assessment).await
            })
            .await
            .map_err(|e| PipelineError::Transient(format!("assessment persist failed: {:#}", e)))
    }

    async fn reject(
        &self,
        intent: &TradeIntent,
        reason: RejectReason,
        risk_score: f64,
        now: i64,
    ) -> Result<(), PipelineError> {
        warn!(
            "RiskManager [{}]: intent {} rejected: {}",
            intent.symbol, intent.id, reason
        );
        let assessment = RiskAssessment::rejected(intent.id, reason, risk_score, now);
        self.persist_assessment(&assessment).await?;
        Err(PipelineError::Rejected(reason))
    }

    /// Price chain: time-series store, then the intent's expectation, then a
    /// hard sentinel.
    async fn resolve_price(&self, intent: &TradeIntent) -> Decimal {
        match self.candle_store.latest_price(&intent.symbol).await {
            Ok(Some(price)) if price > Decimal::ZERO => price,
            Ok(_) | Err(_) if intent.expected_price > Decimal::ZERO => {
                warn!(
                    "RiskManager [{}]: no stored price, using intent expectation {}",
                    intent.symbol, intent.expected_price
                );
                intent.expected_price
            }
            _ => {
                warn!(
                    "RiskManager [{}]: using_fallback_price {}",
                    intent.symbol, FALLBACK_PRICE
                );
                FALLBACK_PRICE
            }
        }
    }

    /// ATR and recent-return volatility from the stored window.
    fn resolve_volatility(&self, symbol: &str, candles: &[Candle], price: Decimal) -> (Decimal, f64) {
        let atr = crate::application::technical_analysis::indicators::compute_snapshot(candles)
            .atr
            .and_then(Decimal::from_f64_retain)
            .filter(|a| *a > Decimal::ZERO)
            .unwrap_or_else(|| {
                warn!("RiskManager [{}]: no ATR available, using 2% of price", symbol);
                price * dec!(0.02)
            });

        let closes: Vec<f64> = candles
            .iter()
            .filter_map(|c| c.close.to_f64())
            .filter(|c| *c > 0.0)
            .collect();
        let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let return_std = if returns.len() >= 2 {
            (&returns).std_dev()
        } else {
            0.0
        };
        (atr, return_std)
    }

    async fn exchange_info(&self, symbol: &str) -> ExchangeInfo {
        match self
            .retry
            .run("exchange info", || self.exchange.get_exchange_info(symbol))
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    "RiskManager [{}]: exchange info unavailable ({}), using defaults",
                    symbol, e
                );
                ExchangeInfo {
                    min_lot: dec!(0.00001),
                    tick_size: dec!(0.01),
                    step_size: dec!(0.00001),
                }
            }
        }
    }

    async fn open_risk(&self, symbol: &str) -> (Decimal, Decimal) {
        let open: Vec<Position> = self
            .positions
            .find_open()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.exchange == self.config.exchange)
            .collect();
        let total = open.iter().map(|p| p.risk_usd()).sum();
        let cluster = cluster_of(symbol);
        let cluster_total = open
            .iter()
            .filter(|p| cluster_of(&p.symbol) == cluster)
            .map(|p| p.risk_usd())
            .sum();
        (total, cluster_total)
    }

    /// Composite risk score in [0, 1]: trade risk against its cap, inverse
    /// confidence, and recent return volatility.
    fn risk_score(&self, sizing: &Sizing, balance: Decimal, confidence: f64, return_std: f64) -> f64 {
        let risk_cap = (balance * self.config.max_risk_per_trade_pct).to_f64().unwrap_or(1.0);
        let risk_part = if risk_cap > 0.0 {
            (sizing.risk_usd.to_f64().unwrap_or(0.0) / risk_cap).min(1.0)
        } else {
            1.0
        };
        let vol_part = (return_std * 100.0).min(1.0);
        (0.5 * risk_part + 0.3 * (1.0 - confidence) + 0.2 * vol_part).clamp(0.0, 1.0)
    }

    async fn on_intent(&self, intent: TradeIntent) -> Result<(), PipelineError> {
        let now = Utc::now().timestamp_millis();
        if !(0.0..=1.0).contains(&intent.confidence) {
            return Err(PipelineError::Contract(format!(
                "intent {} confidence {} out of [0,1]",
                intent.id, intent.confidence
            )));
        }

        // Inputs gathered outside the balance mutex: price, volatility, lot
        // constraints, open exposure.
        let price = self.resolve_price(&intent).await;
        let candles = self
            .candle_store
            .recent_candles(&intent.symbol, self.config.timeframe, INPUT_CANDLES)
            .await
            .unwrap_or_default();
        let (atr, return_std) = self.resolve_volatility(&intent.symbol, &candles, price);
        let info = self.exchange_info(&intent.symbol).await;
        let (open_risk, cluster_risk) = self.open_risk(&intent.symbol).await;

        let levels = stops::place(&self.config.stop, intent.action, price, Some(atr), &candles);

        // Everything that reads or writes spendable funds happens inside the
        // book's critical section, including the approval publication.
        let mut book = self.book.lock().await;
        let balance = book.account_balance;

        let raw = sizing::compute(
            &self.config.sizing,
            balance,
            price,
            intent.confidence,
            levels.stop_distance,
        );
        let mut quantity = sizing::round_to_step(raw.quantity, info.step_size);

        if quantity < info.min_lot {
            quantity = info.min_lot;
            let size_usd = quantity * price;
            if size_usd > self.config.sizing.tiers.ceiling_usd(balance) || size_usd > book.available()
            {
                drop(book);
                let score = self.risk_score(&raw, balance, intent.confidence, return_std);
                return self
                    .reject(&intent, RejectReason::BelowMinLotExceedsBudget, score, now)
                    .await;
            }
        }
        let sized = Sizing {
            quantity,
            size_usd: quantity * price,
            risk_usd: quantity * levels.stop_distance,
        };
        let score = self.risk_score(&sized, balance, intent.confidence, return_std);

        let ctx = ValidationContext {
            intent: &intent,
            sizing: &sized,
            stops: &levels,
            entry_price: price,
            balance,
            open_risk,
            cluster_risk,
        };
        if let Err((layer, reason)) = self.pipeline.run(&ctx) {
            drop(book);
            info!(
                "RiskManager [{}]: intent {} failed {} layer",
                intent.symbol, intent.id, layer
            );
            return self.reject(&intent, reason, score, now).await;
        }

        let order_id = Uuid::new_v4();
        if let Err(reason) = book.reserve(order_id, sized.size_usd) {
            let available = book.available();
            drop(book);
            warn!(
                "RiskManager [{}]: {} needed, {} available",
                intent.symbol, sized.size_usd, available
            );
            return self.reject(&intent, reason, score, now).await;
        }

        let assessment = RiskAssessment::approved(intent.id, score, now);
        let order = ValidatedOrder {
            order_id,
            intent_id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.action,
            quantity: sized.quantity,
            expected_price: price,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            reserved_usd: sized.size_usd,
        };

        let committed = async {
            self.persist_assessment(&assessment).await?;
            self.bus
                .publish(&Topic::TradeOrder, Payload::Order(order), self.name())
                .await
                .map_err(|e| PipelineError::Transient(e.to_string()))
        }
        .await;
        if let Err(e) = committed {
            // The approval never left the region; the hold must not survive
            // the redelivery that follows.
            book.release(order_id);
            return Err(e);
        }
        drop(book);

        info!(
            "RiskManager [{}]: approved order {} qty {} (reserved {}, SL {}, TP {})",
            intent.symbol, order_id, sized.quantity, sized.size_usd, levels.stop_loss, levels.take_profit
        );
        Ok(())
    }

    async fn on_order_status(&self, event: OrderStatusEvent) -> Result<(), PipelineError> {
        let mut book = self.book.lock().await;
        match event.status {
            OrderStatus::Filled => {
                let before = book.account_balance;
                book.settle_filled(event.order_id);
                if book.account_balance != before {
                    info!(
                        "RiskManager: order {} filled, balance {} -> {}",
                        event.order_id, before, book.account_balance
                    );
                }
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed => {
                book.release(event.order_id);
            }
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for RiskManager {
    fn name(&self) -> &'static str {
        "risk_manager"
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::TradeIntent, Topic::OrderStatus]
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        let balance = self
            .retry
            .run("fetch balance", || self.exchange.get_balance())
            .await?;
        let mut book = self.book.lock().await;
        *book = BalanceBook::new(balance);
        info!("RiskManager: session balance {}", balance);
        Ok(())
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        match envelope.payload {
            Payload::Intent(intent) => self.on_intent(intent).await,
            Payload::OrderStatus(event) => self.on_order_status(event).await,
            other => Err(PipelineError::Contract(format!(
                "unexpected payload for risk manager: {:?}",
                other
            ))),
        }
    }
}
