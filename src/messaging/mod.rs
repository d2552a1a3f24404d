// Bus contract and delivery handshake
pub mod bus;

// Envelope, payload taxonomy, topics
pub mod envelope;

pub use bus::{Delivery, MessageBus, RedeliveryHook};
pub use envelope::{DiagnosticEvent, Envelope, Payload, SCHEMA_VERSION, Topic};
