// Domain-specific error types
pub mod errors;

// Order records and validated orders
pub mod order;

// Port interfaces (exchange, time-series store)
pub mod ports;

// Position lifecycle and PnL
pub mod position;

// Repository traits
pub mod repositories;

// Risk assessments and rejection reasons
pub mod risk;

// Signals, intents, fusion metadata
pub mod signal;

// Core shared types
pub mod types;
