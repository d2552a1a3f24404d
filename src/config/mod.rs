//! Configuration loading from environment variables, organized per agent:
//! DataCollection, TechnicalAnalysis, Strategy, Risk, and Execution.

use crate::application::data_collection::{CollectionMode, DataCollectionConfig};
use crate::application::execution::ExecutionConfig;
use crate::application::risk::RiskConfig;
use crate::application::risk::sizing::SizingMethod;
use crate::application::risk::stops::StopMethod;
use crate::application::strategy::StrategyConfig;
use crate::application::strategy::fusion::FusionStrategy;
use crate::application::technical_analysis::AnalysisConfig;
use crate::domain::types::Timeframe;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Application execution mode. Live trading needs a real exchange driver,
/// which is wired outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Paper,
    Live,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(RunMode::Paper),
            "live" => Ok(RunMode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'paper' or 'live'", s),
        }
    }
}

/// Exchange credentials, read once at startup. Never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub database_url: String,
    pub credentials: Credentials,

    pub data: DataCollectionConfig,
    pub analysis: AnalysisConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(key, default_secs)?))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode: RunMode = env_or("MODE", RunMode::Paper)?;
        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTC/USDT,ETH/USDT".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            anyhow::bail!("SYMBOLS must name at least one symbol");
        }
        let timeframe: Timeframe = env_or("TIMEFRAME", Timeframe::M1)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/cryptoflow.db".to_string());

        let credentials = Credentials {
            api_key: env::var("EXCHANGE_API_KEY").unwrap_or_default(),
            api_secret: env::var("EXCHANGE_API_SECRET").unwrap_or_default(),
        };
        if mode == RunMode::Live && credentials.api_key.is_empty() {
            anyhow::bail!("EXCHANGE_API_KEY is required in live mode");
        }

        let data = DataCollectionConfig {
            symbols: symbols.clone(),
            timeframe,
            interval: env_secs("DATA_INTERVAL_SECONDS", 30)?,
            mode: env_or("DATA_MODE", CollectionMode::Polling)?,
            ws_silence_threshold: env_secs("WS_SILENCE_THRESHOLD_SECONDS", 90)?,
            candle_fetch: env_or("DATA_CANDLE_FETCH", 5usize)?,
        };

        let analysis = AnalysisConfig {
            symbols: symbols.clone(),
            timeframe,
            window_len: env_or("TA_WINDOW_LEN", 200usize)?,
            min_window: env_or("TA_MIN_WINDOW", 50usize)?,
        };

        let decision_interval = env_secs("STRATEGY_DECISION_INTERVAL_SECONDS", 60)?;
        let strategy = StrategyConfig {
            fusion_strategy: env_or("STRATEGY_FUSION", FusionStrategy::Hybrid)?,
            min_signals: env_or("STRATEGY_MIN_SIGNALS", 2usize)?,
            signal_timeout: env_secs("STRATEGY_SIGNAL_TIMEOUT_SECONDS", 300)?,
            buffer_max: env_or("STRATEGY_BUFFER_MAX", 50usize)?,
            min_confidence: env_or("STRATEGY_MIN_CONFIDENCE", 0.6f64)?,
            decision_interval,
            cooldown: match env::var("STRATEGY_COOLDOWN_SECONDS") {
                Ok(raw) => Duration::from_secs(
                    raw.parse().map_err(|e| anyhow::anyhow!("Invalid STRATEGY_COOLDOWN_SECONDS: {}", e))?,
                ),
                Err(_) => decision_interval,
            },
            min_agreement: env_or("STRATEGY_MIN_AGREEMENT", 0.6f64)?,
            hybrid_weights: Default::default(),
            adaptive_weights: env_or("STRATEGY_ADAPTIVE_WEIGHTS", false)?,
        };

        let mut risk = RiskConfig {
            exchange: env::var("EXCHANGE_NAME").unwrap_or_else(|_| "paper".to_string()),
            timeframe,
            min_confidence: env_or("RISK_MIN_CONFIDENCE", 0.6f64)?,
            min_rr: env_or("RISK_MIN_RR", Decimal::new(15, 1))?,
            max_risk_per_trade_pct: env_or("RISK_MAX_RISK_PER_TRADE", Decimal::new(1, 2))?,
            max_portfolio_risk_pct: env_or("RISK_MAX_PORTFOLIO_RISK", Decimal::new(20, 2))?,
            cluster_risk_cap_pct: env_or("RISK_CLUSTER_CAP", Decimal::new(5, 2))?,
            ..Default::default()
        };
        risk.sizing.method = env_or("RISK_SIZING_METHOD", SizingMethod::Hybrid)?;
        risk.sizing.target_rr = env_or("RISK_RR", Decimal::new(2, 0))?;
        risk.stop.method = env_or("RISK_STOP_METHOD", StopMethod::AtrBased)?;
        risk.stop.atr_k = env_or("RISK_ATR_K", Decimal::new(2, 0))?;
        risk.stop.rr = risk.sizing.target_rr;
        risk.stop.trailing.enabled = env_or("RISK_TRAILING_ENABLED", false)?;
        risk.stop.trailing.activation_pct = env_or("RISK_TRAILING_ACTIVATION", 0.01f64)?;

        let execution = ExecutionConfig {
            exchange: risk.exchange.clone(),
            monitoring_interval: env_secs("EXEC_MONITORING_INTERVAL_SECONDS", 10)?,
            place_deadline: env_secs("EXEC_ORDER_TIMEOUT_SECONDS", 5)?,
            fill_deadline: env_secs("EXEC_FILL_TIMEOUT_SECONDS", 30)?,
            max_slippage_pct: env_or("EXEC_MAX_SLIPPAGE_PCT", 1.0f64)?,
            snapshot_every_ticks: env_or("EXEC_SNAPSHOT_EVERY_TICKS", 6u64)?,
            trailing: risk.stop.trailing,
        };

        let config = Self {
            mode,
            symbols,
            timeframe,
            database_url,
            credentials,
            data,
            analysis,
            strategy,
            risk,
            execution,
        };
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strategy.min_confidence) {
            anyhow::bail!("STRATEGY_MIN_CONFIDENCE must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.risk.min_confidence) {
            anyhow::bail!("RISK_MIN_CONFIDENCE must be in [0, 1]");
        }
        if self.risk.max_risk_per_trade_pct <= Decimal::ZERO
            || self.risk.max_risk_per_trade_pct > Decimal::ONE
        {
            anyhow::bail!("RISK_MAX_RISK_PER_TRADE must be in (0, 1]");
        }
        if self.risk.max_portfolio_risk_pct <= Decimal::ZERO
            || self.risk.max_portfolio_risk_pct > Decimal::ONE
        {
            anyhow::bail!("RISK_MAX_PORTFOLIO_RISK must be in (0, 1]");
        }
        if self.analysis.min_window > self.analysis.window_len {
            anyhow::bail!("TA_MIN_WINDOW cannot exceed TA_WINDOW_LEN");
        }
        if self.strategy.min_signals == 0 {
            anyhow::bail!("STRATEGY_MIN_SIGNALS must be positive");
        }
        Ok(())
    }
}
