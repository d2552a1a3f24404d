pub mod bus;
pub mod mock;
pub mod persistence;
pub mod timeseries;

pub use bus::InMemoryBus;
pub use mock::MockExchange;
pub use timeseries::SqliteCandleStore;
