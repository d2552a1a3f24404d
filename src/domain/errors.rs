use crate::domain::risk::RejectReason;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the exchange adapter, classified for retry policy.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited{}", retry_after.map(|d| format!("; retry after {:?}", d)).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("rejected by exchange: {0}")]
    Rejected(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),
}

impl ExchangeError {
    /// Transient failures are retried with backoff; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::RateLimited { .. } | ExchangeError::Timeout(_)
        )
    }

    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to {topic} timed out after {deadline:?}")]
    PublishTimeout { topic: String, deadline: Duration },

    #[error("topic {0} is closed")]
    TopicClosed(String),
}

/// Handler-level error taxonomy. The agent framework maps each variant to a
/// delivery outcome: transient -> redeliver, contract -> dead-letter,
/// domain rejection -> ack (already recorded), invariant -> crash the task.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("rate limited{}", .0.map(|d| format!("; retry after {:?}", d)).unwrap_or_default())]
    RateLimited(Option<Duration>),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("domain rejection: {0}")]
    Rejected(RejectReason),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl From<ExchangeError> for PipelineError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::RateLimited { retry_after } => PipelineError::RateLimited(retry_after),
            ExchangeError::Rejected(_) | ExchangeError::InsufficientFunds(_) => {
                PipelineError::Rejected(RejectReason::ExchangeRejected)
            }
            ExchangeError::InvalidParam(m) => PipelineError::Contract(m),
            ExchangeError::Network(m) => PipelineError::Transient(m),
            ExchangeError::Timeout(_) => PipelineError::Rejected(RejectReason::Timeout),
        }
    }
}
