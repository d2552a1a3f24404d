// SQLite connection pool and schema
pub mod database;

// Repository implementations over the relational store
pub mod repositories;

pub use database::Database;
pub use repositories::{
    SqliteAssessmentRepository, SqliteDecisionRepository, SqliteOrderRepository,
    SqlitePositionRepository, SqliteSignalRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
