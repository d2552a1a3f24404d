//! DataCollection agent: keeps a gap-tolerant stream of ticks and candles
//! flowing into the time-series store and onto the market topics. Streaming
//! mode carries a per-symbol silence watchdog that falls back to polling and
//! recovers when the stream resumes.

use crate::domain::ports::{CandleStore, ExchangeAdapter};
use crate::domain::types::{Ticker, Timeframe};
use crate::framework::{Agent, RetryPolicy};
use crate::messaging::{DiagnosticEvent, Envelope, MessageBus, Payload, Topic};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    Streaming,
    Polling,
}

impl FromStr for CollectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "streaming" => Ok(CollectionMode::Streaming),
            "polling" => Ok(CollectionMode::Polling),
            _ => anyhow::bail!("Invalid collection mode: {}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataCollectionConfig {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Polling cadence.
    pub interval: Duration,
    pub mode: CollectionMode,
    /// A streamed symbol silent for this long degrades to polling.
    pub ws_silence_threshold: Duration,
    /// Candles fetched per poll.
    pub candle_fetch: usize,
}

impl Default for DataCollectionConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC/USDT".to_string()],
            timeframe: Timeframe::M1,
            interval: Duration::from_secs(30),
            mode: CollectionMode::Polling,
            ws_silence_threshold: Duration::from_secs(90),
            candle_fetch: 5,
        }
    }
}

#[derive(Default)]
struct StreamState {
    /// Last datum per symbol, unix millis.
    last_seen: HashMap<String, i64>,
    degraded: HashSet<String>,
}

pub struct DataCollectionAgent {
    config: DataCollectionConfig,
    bus: Arc<dyn MessageBus>,
    exchange: Arc<dyn ExchangeAdapter>,
    candle_store: Arc<dyn CandleStore>,
    /// Last published candle open_time per symbol; the downstream contract is
    /// strictly increasing open times.
    last_published: Mutex<HashMap<String, i64>>,
    dropped_candles: AtomicU64,
    stream: Arc<Mutex<StreamState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    retry: RetryPolicy,
}

impl DataCollectionAgent {
    pub fn new(
        config: DataCollectionConfig,
        bus: Arc<dyn MessageBus>,
        exchange: Arc<dyn ExchangeAdapter>,
        candle_store: Arc<dyn CandleStore>,
    ) -> Self {
        Self {
            config,
            bus,
            exchange,
            candle_store,
            last_published: Mutex::new(HashMap::new()),
            dropped_candles: AtomicU64::new(0),
            stream: Arc::new(Mutex::new(StreamState::default())),
            tasks: Mutex::new(Vec::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn dropped_candles(&self) -> u64 {
        self.dropped_candles.load(Ordering::SeqCst)
    }

    async fn store_and_publish_tick(&self, tick: &Ticker) -> anyhow::Result<()> {
        self.retry
            .run("upsert ticker", || async { self.candle_store.upsert_ticker(tick).await })
            .await?;
        self.bus
            .publish(
                &Topic::MarketTick(tick.symbol.clone()),
                Payload::Tick(tick.clone()),
                self.name(),
            )
            .await?;
        Ok(())
    }

    async fn poll_ticker(&self, symbol: &str) -> anyhow::Result<()> {
        let tick = self
            .retry
            .run("fetch ticker", || self.exchange.get_ticker(symbol))
            .await?;
        self.store_and_publish_tick(&tick).await
    }

    /// Fetches recent candles, stores all closed ones, and publishes those
    /// the downstream has not seen. The in-progress candle is withheld.
    async fn poll_candles(&self, symbol: &str) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut candles = self
            .retry
            .run("fetch ohlcv", || {
                self.exchange
                    .get_ohlcv(symbol, self.config.timeframe, self.config.candle_fetch)
            })
            .await?;
        candles.retain(|c| c.open_time + c.timeframe.duration_ms() <= now);
        candles.sort_by_key(|c| c.open_time);

        for candle in candles {
            self.retry
                .run("upsert candle", || async { self.candle_store.upsert_candle(&candle).await })
                .await?;

            let mut last = self.last_published.lock().await;
            let entry = last.entry(symbol.to_string()).or_insert(i64::MIN);
            if candle.open_time <= *entry {
                self.dropped_candles.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "DataCollection [{}]: duplicate candle {} dropped ({} total)",
                    symbol,
                    candle.open_time,
                    self.dropped_candles.load(Ordering::SeqCst)
                );
                continue;
            }
            *entry = candle.open_time;
            drop(last);

            self.bus
                .publish(
                    &Topic::MarketOhlcv(symbol.to_string()),
                    Payload::Ohlcv(candle),
                    self.name(),
                )
                .await?;
        }
        Ok(())
    }

    async fn emit_diagnostic(&self, kind: &str, detail: String) {
        let _ = self
            .bus
            .publish(
                &Topic::Diagnostics,
                Payload::Diagnostic(DiagnosticEvent {
                    agent: self.name().to_string(),
                    kind: kind.to_string(),
                    detail,
                }),
                self.name(),
            )
            .await;
    }

    /// Marks symbols silent past the threshold as degraded. Runs from the
    /// watchdog task so detection does not wait on the polling cadence.
    async fn check_stream_health(&self) {
        let threshold_ms = self.config.ws_silence_threshold.as_millis() as i64;
        let now = Utc::now().timestamp_millis();

        let newly_degraded: Vec<String> = {
            let mut stream = self.stream.lock().await;
            let mut out = Vec::new();
            for symbol in &self.config.symbols {
                let last = stream.last_seen.get(symbol).copied().unwrap_or(now);
                if now - last > threshold_ms && !stream.degraded.contains(symbol) {
                    stream.degraded.insert(symbol.clone());
                    out.push(symbol.clone());
                }
            }
            out
        };

        for symbol in newly_degraded {
            warn!(
                "DataCollection [{}]: stream silent beyond {:?}, falling back to polling",
                symbol, self.config.ws_silence_threshold
            );
            self.emit_diagnostic(
                "stream_degraded",
                format!("{} silent beyond {:?}", symbol, self.config.ws_silence_threshold),
            )
            .await;
        }
    }

    /// Symbols the periodic poll must cover for ticks.
    async fn symbols_to_poll(&self) -> Vec<String> {
        match self.config.mode {
            CollectionMode::Polling => self.config.symbols.clone(),
            CollectionMode::Streaming => {
                let stream = self.stream.lock().await;
                self.config
                    .symbols
                    .iter()
                    .filter(|s| stream.degraded.contains(*s))
                    .cloned()
                    .collect()
            }
        }
    }
}

#[async_trait]
impl Agent for DataCollectionAgent {
    fn name(&self) -> &'static str {
        "data_collection"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.interval)
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.config.mode != CollectionMode::Streaming {
            return Ok(());
        }

        let mut rx = self
            .exchange
            .subscribe_ticks(self.config.symbols.clone())
            .await?;

        {
            let mut stream = self.stream.lock().await;
            let now = Utc::now().timestamp_millis();
            for symbol in &self.config.symbols {
                stream.last_seen.insert(symbol.clone(), now);
            }
        }

        // Stream consumer: stores and republishes ticks, heals degradation.
        let bus = self.bus.clone();
        let store = self.candle_store.clone();
        let stream = self.stream.clone();
        let retry = self.retry;
        let consumer = tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                let resumed = {
                    let mut state = stream.lock().await;
                    state.last_seen.insert(tick.symbol.clone(), tick.ts);
                    state.degraded.remove(&tick.symbol)
                };
                if resumed {
                    info!("DataCollection [{}]: stream resumed", tick.symbol);
                    let _ = bus
                        .publish(
                            &Topic::Diagnostics,
                            Payload::Diagnostic(DiagnosticEvent {
                                agent: "data_collection".to_string(),
                                kind: "stream_resumed".to_string(),
                                detail: tick.symbol.clone(),
                            }),
                            "data_collection",
                        )
                        .await;
                }

                if let Err(e) = retry
                    .run("upsert ticker", || async { store.upsert_ticker(&tick).await })
                    .await
                {
                    warn!("DataCollection [{}]: ticker write failed: {:#}", tick.symbol, e);
                    continue;
                }
                if let Err(e) = bus
                    .publish(
                        &Topic::MarketTick(tick.symbol.clone()),
                        Payload::Tick(tick.clone()),
                        "data_collection",
                    )
                    .await
                {
                    warn!("DataCollection [{}]: tick publish failed: {}", tick.symbol, e);
                }
            }
            warn!("DataCollection: tick stream ended");
        });
        self.tasks.lock().await.push(consumer);

        // Watchdog checks silence well inside the threshold so degradation
        // is flagged near the deadline, not at the next polling tick.
        let bus = self.bus.clone();
        let stream = self.stream.clone();
        let symbols = self.config.symbols.clone();
        let threshold = self.config.ws_silence_threshold;
        let cadence = (threshold / 3).max(Duration::from_millis(250));
        let watchdog = tokio::spawn(async move {
            let threshold_ms = threshold.as_millis() as i64;
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp_millis();
                let newly_degraded: Vec<String> = {
                    let mut state = stream.lock().await;
                    let mut out = Vec::new();
                    for symbol in &symbols {
                        let last = state.last_seen.get(symbol).copied().unwrap_or(now);
                        if now - last > threshold_ms && !state.degraded.contains(symbol) {
                            state.degraded.insert(symbol.clone());
                            out.push(symbol.clone());
                        }
                    }
                    out
                };
                for symbol in newly_degraded {
                    warn!(
                        "DataCollection [{}]: stream silent beyond {:?}, falling back to polling",
                        symbol, threshold
                    );
                    let _ = bus
                        .publish(
                            &Topic::Diagnostics,
                            Payload::Diagnostic(DiagnosticEvent {
                                agent: "data_collection".to_string(),
                                kind: "stream_degraded".to_string(),
                                detail: format!("{} silent beyond {:?}", symbol, threshold),
                            }),
                            "data_collection",
                        )
                        .await;
                }
            }
        });
        self.tasks.lock().await.push(watchdog);
        Ok(())
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        Err(PipelineError::Contract(format!(
            "data collection consumes no topics, got {:?}",
            envelope.payload
        )))
    }

    async fn tick(&self) -> anyhow::Result<()> {
        if self.config.mode == CollectionMode::Streaming {
            self.check_stream_health().await;
        }

        for symbol in self.symbols_to_poll().await {
            if let Err(e) = self.poll_ticker(&symbol).await {
                warn!("DataCollection [{}]: ticker poll failed: {:#}", symbol, e);
            }
        }

        // Candles are polled for every symbol in both modes; streams carry
        // ticks only.
        for symbol in &self.config.symbols {
            if let Err(e) = self.poll_candles(symbol).await {
                warn!("DataCollection [{}]: candle poll failed: {:#}", symbol, e);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}
