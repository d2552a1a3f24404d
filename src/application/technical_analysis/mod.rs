//! TechnicalAnalysis agent: consumes per-symbol candle topics, maintains a
//! rolling window per symbol, derives signals, persists and publishes them.

pub mod indicators;
pub mod rules;

use crate::domain::errors::PipelineError;
use crate::domain::repositories::SignalRepository;
use crate::domain::types::{Candle, Timeframe};
use crate::framework::{Agent, RetryPolicy};
use crate::messaging::{Envelope, MessageBus, Payload, Topic};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Rolling window length; covers the longest indicator lookback.
    pub window_len: usize,
    /// Candles required before any signal is emitted.
    pub min_window: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC/USDT".to_string()],
            timeframe: Timeframe::M1,
            window_len: 200,
            min_window: 50,
        }
    }
}

struct SymbolWindow {
    candles: Vec<Candle>,
    dropped_stale: u64,
}

pub struct TechnicalAnalysis {
    config: AnalysisConfig,
    bus: Arc<dyn MessageBus>,
    signal_repository: Arc<dyn SignalRepository>,
    // One consumer task per symbol topic is the only writer of its window;
    // the mutex is uncontended and only satisfies the shared-state rules.
    windows: HashMap<String, Mutex<SymbolWindow>>,
    retry: RetryPolicy,
}

impl TechnicalAnalysis {
    pub fn new(
        config: AnalysisConfig,
        bus: Arc<dyn MessageBus>,
        signal_repository: Arc<dyn SignalRepository>,
    ) -> Self {
        let windows = config
            .symbols
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    Mutex::new(SymbolWindow {
                        candles: Vec::with_capacity(config.window_len + 1),
                        dropped_stale: 0,
                    }),
                )
            })
            .collect();
        Self {
            config,
            bus,
            signal_repository,
            windows,
            retry: RetryPolicy::default(),
        }
    }

    async fn on_candle(&self, candle: Candle) -> Result<(), PipelineError> {
        if !candle.is_well_formed() {
            return Err(PipelineError::Contract(format!(
                "malformed candle for {} at {}",
                candle.symbol, candle.open_time
            )));
        }

        if candle.timeframe != self.config.timeframe {
            debug!(
                "TechnicalAnalysis [{}]: ignoring {} candle, analyzing {}",
                candle.symbol, candle.timeframe, self.config.timeframe
            );
            return Ok(());
        }
        let Some(window) = self.windows.get(&candle.symbol) else {
            warn!("TechnicalAnalysis: candle for unconfigured symbol {}", candle.symbol);
            return Ok(());
        };
        let mut window = window.lock().await;

        // Redeliveries and late duplicates are dropped; the window only ever
        // moves forward in open_time.
        let last_open_time = window.candles.last().map(|c| c.open_time);
        if let Some(last) = last_open_time
            && candle.open_time <= last
        {
            window.dropped_stale += 1;
            debug!(
                "TechnicalAnalysis [{}]: dropped stale candle {} (last {}, total dropped {})",
                candle.symbol, candle.open_time, last, window.dropped_stale
            );
            return Ok(());
        }

        let symbol = candle.symbol.clone();
        let close = candle.close;
        let emitted_at = candle.open_time + candle.timeframe.duration_ms();
        window.candles.push(candle);
        let len = window.candles.len();
        if len > self.config.window_len {
            let excess = len - self.config.window_len;
            window.candles.drain(..excess);
        }

        if window.candles.len() < self.config.min_window {
            info!(
                "TechnicalAnalysis [{}]: insufficient_data ({} of {} candles, deficit {})",
                symbol,
                window.candles.len(),
                self.config.min_window,
                self.config.min_window - window.candles.len()
            );
            return Ok(());
        }

        let curr = indicators::compute_snapshot(&window.candles);
        let prev = indicators::compute_snapshot(&window.candles[..window.candles.len() - 1]);
        let signals = rules::evaluate(&symbol, close, &prev, &curr, emitted_at);
        drop(window);

        for signal in signals {
            self.retry
                .run("persist signal", || async {
                    self.signal_repository.save(&signal).await
                })
                .await
                .map_err(|e| PipelineError::Transient(format!("signal persist failed: {:#}", e)))?;

            info!(
                "TechnicalAnalysis [{}]: {} {} signal, confidence {:.2}",
                symbol, signal.source, signal.kind, signal.confidence
            );
            self.bus
                .publish(&Topic::SignalsTech, Payload::Signal(signal), self.name())
                .await
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for TechnicalAnalysis {
    fn name(&self) -> &'static str {
        "technical_analysis"
    }

    fn subscriptions(&self) -> Vec<Topic> {
        self.config
            .symbols
            .iter()
            .map(|s| Topic::MarketOhlcv(s.clone()))
            .collect()
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        match envelope.payload {
            Payload::Ohlcv(candle) => self.on_candle(candle).await,
            other => Err(PipelineError::Contract(format!(
                "unexpected payload on candle topic: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::InMemoryBus;
    use anyhow::Result;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSignalRepository {
        saved: AtomicUsize,
    }

    #[async_trait]
    impl SignalRepository for NullSignalRepository {
        async fn save(&self, _signal: &crate::domain::signal::Signal) -> Result<()> {
            self.saved.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn candle(open_time: i64, close: f64) -> Candle {
        let c = Decimal::from_f64_retain(close).unwrap();
        Candle {
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::M1,
            open_time,
            open: c,
            high: c + dec!(1),
            low: c - dec!(1),
            close: c,
            volume: dec!(1),
        }
    }

    fn agent(bus: Arc<InMemoryBus>, repo: Arc<NullSignalRepository>) -> TechnicalAnalysis {
        TechnicalAnalysis::new(
            AnalysisConfig {
                min_window: 20,
                ..Default::default()
            },
            bus,
            repo,
        )
    }

    #[tokio::test]
    async fn test_cold_start_emits_nothing() {
        let bus = Arc::new(InMemoryBus::new());
        let repo = Arc::new(NullSignalRepository {
            saved: AtomicUsize::new(0),
        });
        let ta = agent(bus.clone(), repo.clone());

        for i in 0..10 {
            ta.on_candle(candle(i * 60_000, 100.0)).await.unwrap();
        }
        assert_eq!(repo.saved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_candles_are_dropped() {
        let bus = Arc::new(InMemoryBus::new());
        let repo = Arc::new(NullSignalRepository {
            saved: AtomicUsize::new(0),
        });
        let ta = agent(bus.clone(), repo.clone());

        ta.on_candle(candle(120_000, 100.0)).await.unwrap();
        // Same open_time and an older one: both dropped.
        ta.on_candle(candle(120_000, 101.0)).await.unwrap();
        ta.on_candle(candle(60_000, 99.0)).await.unwrap();

        let window = ta.windows.get("BTC/USDT").unwrap().lock().await;
        assert_eq!(window.candles.len(), 1);
        assert_eq!(window.dropped_stale, 2);
        assert_eq!(window.candles[0].close, dec!(100));
    }

    #[tokio::test]
    async fn test_malformed_candle_is_contract_error() {
        let bus = Arc::new(InMemoryBus::new());
        let repo = Arc::new(NullSignalRepository {
            saved: AtomicUsize::new(0),
        });
        let ta = agent(bus, repo);

        let mut bad = candle(60_000, 100.0);
        bad.high = dec!(1); // below the body
        let err = ta.on_candle(bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::Contract(_)));
    }

    #[tokio::test]
    async fn test_oversold_window_publishes_buy_signal() {
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.subscribe(&Topic::SignalsTech, "test").await;
        let repo = Arc::new(NullSignalRepository {
            saved: AtomicUsize::new(0),
        });
        let ta = agent(bus.clone(), repo.clone());

        // Steady decline drives RSI deep below 30.
        for i in 0..40 {
            ta.on_candle(candle(i * 60_000, 200.0 - i as f64 * 3.0))
                .await
                .unwrap();
        }

        let delivery = rx.recv().await.expect("expected at least one signal");
        match &delivery.envelope.payload {
            Payload::Signal(signal) => {
                assert_eq!(signal.symbol, "BTC/USDT");
                assert_eq!(signal.kind, crate::domain::signal::SignalKind::Buy);
                assert!(signal.confidence > 0.0 && signal.confidence <= 1.0);
                assert!(signal.indicators.rsi.unwrap() < 30.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        delivery.ack().await;
        assert!(repo.saved.load(Ordering::SeqCst) >= 1);
    }
}
