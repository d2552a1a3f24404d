use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Structured reason for rejecting an intent or order. These are domain
/// rejections: recorded, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    LowConfidence,
    RrBelowMin,
    RiskCap,
    PortfolioCap,
    CorrelationCap,
    InsufficientAvailableBalance,
    BelowMinLotExceedsBudget,
    ExchangeRejected,
    Timeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::RrBelowMin => "rr_below_min",
            RejectReason::RiskCap => "risk_cap",
            RejectReason::PortfolioCap => "portfolio_cap",
            RejectReason::CorrelationCap => "correlation_cap",
            RejectReason::InsufficientAvailableBalance => "insufficient_available_balance",
            RejectReason::BelowMinLotExceedsBudget => "below_min_lot_exceeds_budget",
            RejectReason::ExchangeRejected => "exchange_rejected",
            RejectReason::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Immutable audit record produced by RiskManager for every intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub approved: bool,
    /// Composite score in [0, 1]; higher means riskier.
    pub risk_score: f64,
    pub reasons: Vec<String>,
    /// Unix millis.
    pub created_at: i64,
}

impl RiskAssessment {
    pub fn approved(intent_id: Uuid, risk_score: f64, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            approved: true,
            risk_score,
            reasons: Vec::new(),
            created_at: now,
        }
    }

    pub fn rejected(intent_id: Uuid, reason: RejectReason, risk_score: f64, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            approved: false,
            risk_score,
            reasons: vec![reason.to_string()],
            created_at: now,
        }
    }
}
