// Agent trait and task runner
pub mod agent;

// Backoff policy shared by all agents
pub mod retry;

pub use agent::{Agent, AgentRunner};
pub use retry::{RetryPolicy, Retryable};
