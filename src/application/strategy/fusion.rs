//! Fusion strategies: collapse a buffer of heterogeneous signals into one
//! (action, confidence) decision. All four strategies expose their per-kind
//! scores so Hybrid can combine them and audits can explain the outcome.

use crate::domain::signal::{KindScores, Signal, SignalKind};
use std::collections::HashMap;
use std::str::FromStr;

/// Half-life of a signal's weight under time decay.
pub const DECAY_HALF_LIFE_SECS: f64 = 1800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    Bayesian,
    Consensus,
    TimeDecay,
    Hybrid,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::Bayesian => "bayesian",
            FusionStrategy::Consensus => "consensus",
            FusionStrategy::TimeDecay => "time_decay",
            FusionStrategy::Hybrid => "hybrid",
        }
    }
}

impl FromStr for FusionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bayesian" => Ok(FusionStrategy::Bayesian),
            "consensus" => Ok(FusionStrategy::Consensus),
            "time_decay" => Ok(FusionStrategy::TimeDecay),
            "hybrid" => Ok(FusionStrategy::Hybrid),
            _ => anyhow::bail!("Invalid fusion strategy: {}", s),
        }
    }
}

/// Weights the Hybrid strategy applies to (bayesian, consensus, time_decay).
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub bayesian: f64,
    pub consensus: f64,
    pub time_decay: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            bayesian: 0.4,
            consensus: 0.3,
            time_decay: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    pub action: SignalKind,
    pub confidence: f64,
    pub scores: KindScores,
}

/// Runs the configured strategy over the buffer. `source_weights` scales
/// per-source confidences for the Bayesian likelihoods only (adaptive
/// weighting); an empty map means every weight is 1.0.
pub fn fuse(
    strategy: FusionStrategy,
    signals: &[Signal],
    now_ms: i64,
    min_agreement: f64,
    hybrid_weights: HybridWeights,
    source_weights: &HashMap<String, f64>,
) -> FusionOutcome {
    match strategy {
        FusionStrategy::Bayesian => {
            let scores = bayesian_scores(signals, source_weights);
            let (action, confidence) = scores.argmax();
            FusionOutcome { action, confidence, scores }
        }
        FusionStrategy::Consensus => {
            let scores = consensus_scores(signals);
            let (kind, share) = scores.argmax();
            // A weak majority is no mandate.
            let action = if kind != SignalKind::Hold && share < min_agreement {
                SignalKind::Hold
            } else {
                kind
            };
            FusionOutcome {
                action,
                confidence: share,
                scores,
            }
        }
        FusionStrategy::TimeDecay => {
            let scores = time_decay_scores(signals, now_ms);
            let (action, confidence) = scores.argmax();
            FusionOutcome { action, confidence, scores }
        }
        FusionStrategy::Hybrid => {
            let b = bayesian_scores(signals, source_weights);
            let c = consensus_scores(signals);
            let t = time_decay_scores(signals, now_ms);
            let w = hybrid_weights;
            let scores = KindScores {
                buy: w.bayesian * b.buy + w.consensus * c.buy + w.time_decay * t.buy,
                sell: w.bayesian * b.sell + w.consensus * c.sell + w.time_decay * t.sell,
                hold: w.bayesian * b.hold + w.consensus * c.hold + w.time_decay * t.hold,
            };
            let (action, confidence) = scores.argmax();
            FusionOutcome { action, confidence, scores }
        }
    }
}

/// Independent-likelihood fusion. Directional kinds multiply their members'
/// confidences (no evidence means zero likelihood); HOLD is the null
/// hypothesis (1 - max confidence)^|HOLD|. Posteriors are normalized.
pub fn bayesian_scores(signals: &[Signal], source_weights: &HashMap<String, f64>) -> KindScores {
    if signals.is_empty() {
        return KindScores::default();
    }

    let conf = |s: &Signal| {
        let w = source_weights.get(&s.source).copied().unwrap_or(1.0);
        (s.confidence * w).clamp(0.0, 1.0)
    };

    let product_for = |kind: SignalKind| -> f64 {
        let members: Vec<f64> = signals.iter().filter(|s| s.kind == kind).map(conf).collect();
        if members.is_empty() {
            0.0
        } else {
            members.iter().product()
        }
    };

    let p_buy = product_for(SignalKind::Buy);
    let p_sell = product_for(SignalKind::Sell);
    let max_conf = signals.iter().map(conf).fold(0.0f64, f64::max);
    let hold_count = signals.iter().filter(|s| s.kind == SignalKind::Hold).count();
    let p_hold = (1.0 - max_conf).powi(hold_count as i32);

    let sum = p_buy + p_sell + p_hold;
    if sum <= 0.0 {
        return KindScores::default();
    }
    KindScores {
        buy: p_buy / sum,
        sell: p_sell / sum,
        hold: p_hold / sum,
    }
}

/// Majority vote: each kind's score is its share of the buffer.
pub fn consensus_scores(signals: &[Signal]) -> KindScores {
    if signals.is_empty() {
        return KindScores::default();
    }
    let total = signals.len() as f64;
    let count = |kind: SignalKind| signals.iter().filter(|s| s.kind == kind).count() as f64;
    KindScores {
        buy: count(SignalKind::Buy) / total,
        sell: count(SignalKind::Sell) / total,
        hold: count(SignalKind::Hold) / total,
    }
}

/// Exponentially decayed confidence mass per kind, normalized by the total
/// weight of the buffer.
pub fn time_decay_scores(signals: &[Signal], now_ms: i64) -> KindScores {
    if signals.is_empty() {
        return KindScores::default();
    }
    let lambda = std::f64::consts::LN_2 / DECAY_HALF_LIFE_SECS;
    let weight = |s: &Signal| {
        let age_secs = ((now_ms - s.emitted_at).max(0) as f64) / 1000.0;
        (-lambda * age_secs).exp()
    };

    let total_weight: f64 = signals.iter().map(weight).sum();
    if total_weight <= 0.0 {
        return KindScores::default();
    }
    let mass = |kind: SignalKind| -> f64 {
        signals
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| weight(s) * s.confidence)
            .sum()
    };
    KindScores {
        buy: mass(SignalKind::Buy) / total_weight,
        sell: mass(SignalKind::Sell) / total_weight,
        hold: mass(SignalKind::Hold) / total_weight,
    }
}
