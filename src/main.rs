//! Headless pipeline launcher: loads configuration, opens the stores, wires
//! the bus and the five agents, then runs until ctrl-c.

use anyhow::Result;
use cryptoflow::application::data_collection::DataCollectionAgent;
use cryptoflow::application::execution::ExecutionAgent;
use cryptoflow::application::risk::RiskManager;
use cryptoflow::application::strategy::StrategyAgent;
use cryptoflow::application::technical_analysis::TechnicalAnalysis;
use cryptoflow::config::{Config, RunMode};
use cryptoflow::domain::ports::{CandleStore, ExchangeAdapter};
use cryptoflow::framework::AgentRunner;
use cryptoflow::infrastructure::bus::InMemoryBus;
use cryptoflow::infrastructure::mock::MockExchange;
use cryptoflow::infrastructure::persistence::Database;
use cryptoflow::infrastructure::persistence::repositories::{
    SqliteAssessmentRepository, SqliteDecisionRepository, SqliteOrderRepository,
    SqlitePositionRepository, SqliteSignalRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
use cryptoflow::infrastructure::timeseries::SqliteCandleStore;
use cryptoflow::messaging::MessageBus;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("cryptoflow {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: mode={:?}, symbols={:?}, timeframe={}",
        config.mode, config.symbols, config.timeframe
    );

    let exchange: Arc<dyn ExchangeAdapter> = match config.mode {
        RunMode::Paper => Arc::new(MockExchange::new()),
        RunMode::Live => {
            // The live exchange driver is an external collaborator; it plugs
            // in through the same port.
            anyhow::bail!("live mode requires an exchange driver; run MODE=paper")
        }
    };

    let database = Database::new(&config.database_url).await?;
    let candle_store: Arc<dyn CandleStore> = Arc::new(SqliteCandleStore::new(database.pool.clone()));
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());

    let data_collection = Arc::new(DataCollectionAgent::new(
        config.data.clone(),
        bus.clone(),
        exchange.clone(),
        candle_store.clone(),
    ));
    let technical_analysis = Arc::new(TechnicalAnalysis::new(
        config.analysis.clone(),
        bus.clone(),
        Arc::new(SqliteSignalRepository::new(database.pool.clone())),
    ));
    let strategy = Arc::new(StrategyAgent::new(
        config.strategy.clone(),
        bus.clone(),
        Arc::new(SqliteDecisionRepository::new(database.pool.clone())),
    ));
    let risk_manager = Arc::new(RiskManager::new(
        config.risk.clone(),
        bus.clone(),
        exchange.clone(),
        candle_store.clone(),
        Arc::new(SqliteAssessmentRepository::new(database.pool.clone())),
        Arc::new(SqlitePositionRepository::new(database.pool.clone())),
    ));
    let execution = Arc::new(ExecutionAgent::new(
        config.execution.clone(),
        bus.clone(),
        exchange.clone(),
        candle_store.clone(),
        Arc::new(SqliteOrderRepository::new(database.pool.clone())),
        Arc::new(SqlitePositionRepository::new(database.pool.clone())),
        Arc::new(SqliteTradeRepository::new(database.pool.clone())),
        Arc::new(SqliteSnapshotRepository::new(database.pool.clone())),
    ));

    // Downstream consumers start first so no early message is missed.
    let mut runners = Vec::new();
    runners.push(AgentRunner::spawn(execution, bus.clone()).await?);
    runners.push(AgentRunner::spawn(risk_manager, bus.clone()).await?);
    runners.push(AgentRunner::spawn(strategy, bus.clone()).await?);
    runners.push(AgentRunner::spawn(technical_analysis, bus.clone()).await?);
    runners.push(AgentRunner::spawn(data_collection, bus.clone()).await?);

    info!("Pipeline running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    for runner in runners.into_iter().rev() {
        runner.shutdown().await;
    }
    info!("Shutdown complete.");
    Ok(())
}
