//! Five-layer risk validation, ordered; the first failing layer rejects.
//! Modeled as a pipeline of boxed checks so layers stay independently
//! testable.

use crate::domain::risk::RejectReason;
use crate::domain::signal::TradeIntent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::sizing::Sizing;
use super::stops::StopLevels;

/// Static correlation clusters. Risk taken within one cluster is capped as a
/// group because these symbols move together.
pub fn cluster_of(symbol: &str) -> &'static str {
    let base = symbol.split('/').next().unwrap_or(symbol);
    match base {
        "BTC" | "ETH" => "large_cap",
        "SOL" | "AVAX" | "LINK" | "DOT" | "MATIC" => "mid_cap",
        _ => "small_cap",
    }
}

pub struct ValidationContext<'a> {
    pub intent: &'a TradeIntent,
    pub sizing: &'a Sizing,
    pub stops: &'a StopLevels,
    /// Entry price the stops were placed around.
    pub entry_price: Decimal,
    pub balance: Decimal,
    /// Risk at stake across all open positions.
    pub open_risk: Decimal,
    /// Risk at stake across open positions in the intent's cluster.
    pub cluster_risk: Decimal,
}

pub trait RiskCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason>;
}

pub struct ConfidenceCheck {
    pub min_confidence: f64,
}

impl RiskCheck for ConfidenceCheck {
    fn name(&self) -> &'static str {
        "confidence"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason> {
        if ctx.intent.confidence < self.min_confidence {
            return Err(RejectReason::LowConfidence);
        }
        Ok(())
    }
}

pub struct RewardRiskCheck {
    pub min_rr: Decimal,
}

impl RiskCheck for RewardRiskCheck {
    fn name(&self) -> &'static str {
        "reward_risk"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason> {
        if ctx.stops.stop_distance <= Decimal::ZERO {
            return Err(RejectReason::RrBelowMin);
        }
        let reward = (ctx.stops.take_profit - ctx.entry_price).abs();
        let rr = reward / ctx.stops.stop_distance;
        if rr < self.min_rr {
            return Err(RejectReason::RrBelowMin);
        }
        Ok(())
    }
}

pub struct TradeRiskCheck {
    pub max_risk_per_trade_pct: Decimal,
}

impl RiskCheck for TradeRiskCheck {
    fn name(&self) -> &'static str {
        "trade_risk"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason> {
        if ctx.sizing.risk_usd > ctx.balance * self.max_risk_per_trade_pct {
            return Err(RejectReason::RiskCap);
        }
        Ok(())
    }
}

pub struct PortfolioRiskCheck {
    pub max_portfolio_risk_pct: Decimal,
}

impl RiskCheck for PortfolioRiskCheck {
    fn name(&self) -> &'static str {
        "portfolio_risk"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason> {
        let total = ctx.open_risk + ctx.sizing.risk_usd;
        if total > ctx.balance * self.max_portfolio_risk_pct {
            return Err(RejectReason::PortfolioCap);
        }
        Ok(())
    }
}

pub struct CorrelationCheck {
    pub cluster_cap_pct: Decimal,
}

impl RiskCheck for CorrelationCheck {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Result<(), RejectReason> {
        let total = ctx.cluster_risk + ctx.sizing.risk_usd;
        if total > ctx.balance * self.cluster_cap_pct {
            return Err(RejectReason::CorrelationCap);
        }
        Ok(())
    }
}

pub struct ValidationPipeline {
    checks: Vec<Box<dyn RiskCheck>>,
}

impl ValidationPipeline {
    pub fn new(checks: Vec<Box<dyn RiskCheck>>) -> Self {
        Self { checks }
    }

    /// The standard five layers, cheapest checks first.
    pub fn standard(
        min_confidence: f64,
        min_rr: Decimal,
        max_risk_per_trade_pct: Decimal,
        max_portfolio_risk_pct: Decimal,
        cluster_cap_pct: Decimal,
    ) -> Self {
        Self::new(vec![
            Box::new(ConfidenceCheck { min_confidence }),
            Box::new(RewardRiskCheck { min_rr }),
            Box::new(TradeRiskCheck {
                max_risk_per_trade_pct,
            }),
            Box::new(PortfolioRiskCheck {
                max_portfolio_risk_pct,
            }),
            Box::new(CorrelationCheck { cluster_cap_pct }),
        ])
    }

    pub fn run(&self, ctx: &ValidationContext<'_>) -> Result<(), (&'static str, RejectReason)> {
        for check in &self.checks {
            check.check(ctx).map_err(|reason| (check.name(), reason))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::{FusionMeta, KindScores};
    use crate::domain::types::OrderSide;
    use uuid::Uuid;

    fn intent(confidence: f64) -> TradeIntent {
        TradeIntent {
            id: Uuid::new_v4(),
            symbol: "BTC/USDT".to_string(),
            action: OrderSide::Buy,
            confidence,
            expected_price: dec!(121617),
            fusion: FusionMeta {
                strategy: "hybrid".to_string(),
                buffer_size: 3,
                contributing: Vec::new(),
                scores: KindScores::default(),
            },
            created_at: 0,
        }
    }

    fn standard() -> ValidationPipeline {
        ValidationPipeline::standard(0.6, dec!(1.5), dec!(0.01), dec!(0.20), dec!(0.05))
    }

    fn ctx<'a>(
        intent: &'a TradeIntent,
        sizing: &'a Sizing,
        stops: &'a StopLevels,
    ) -> ValidationContext<'a> {
        ValidationContext {
            intent,
            sizing,
            stops,
            entry_price: dec!(121617),
            balance: dec!(10000),
            open_risk: Decimal::ZERO,
            cluster_risk: Decimal::ZERO,
        }
    }

    fn ok_sizing() -> Sizing {
        Sizing {
            quantity: dec!(0.01233),
            size_usd: dec!(1500),
            risk_usd: dec!(36.99),
        }
    }

    fn ok_stops() -> StopLevels {
        StopLevels {
            stop_loss: dec!(118617),
            take_profit: dec!(127617),
            stop_distance: dec!(3000),
        }
    }

    #[test]
    fn test_passing_context() {
        let intent = intent(0.70);
        let (sizing, stops) = (ok_sizing(), ok_stops());
        assert!(standard().run(&ctx(&intent, &sizing, &stops)).is_ok());
    }

    #[test]
    fn test_low_confidence_rejects_first() {
        let intent = intent(0.5);
        let (sizing, stops) = (ok_sizing(), ok_stops());
        let (layer, reason) = standard().run(&ctx(&intent, &sizing, &stops)).unwrap_err();
        assert_eq!(layer, "confidence");
        assert_eq!(reason, RejectReason::LowConfidence);
    }

    #[test]
    fn test_rr_below_min_rejects() {
        let intent = intent(0.70);
        let sizing = ok_sizing();
        let stops = StopLevels {
            stop_loss: dec!(118617),
            take_profit: dec!(124617), // reward 3000 / risk 3000 = 1.0
            stop_distance: dec!(3000),
        };
        let (_, reason) = standard().run(&ctx(&intent, &sizing, &stops)).unwrap_err();
        assert_eq!(reason, RejectReason::RrBelowMin);
    }

    #[test]
    fn test_per_trade_risk_cap() {
        let intent = intent(0.70);
        let stops = ok_stops();
        let sizing = Sizing {
            quantity: dec!(0.05),
            size_usd: dec!(6000),
            risk_usd: dec!(150), // > 1% of 10k
        };
        let (_, reason) = standard().run(&ctx(&intent, &sizing, &stops)).unwrap_err();
        assert_eq!(reason, RejectReason::RiskCap);
    }

    #[test]
    fn test_portfolio_cap_counts_open_risk() {
        let intent = intent(0.70);
        let (sizing, stops) = (ok_sizing(), ok_stops());
        let mut context = ctx(&intent, &sizing, &stops);
        context.open_risk = dec!(1990); // + 36.99 > 20% of 10k
        let (_, reason) = standard().run(&context).unwrap_err();
        assert_eq!(reason, RejectReason::PortfolioCap);
    }

    #[test]
    fn test_cluster_cap() {
        let intent = intent(0.70);
        let (sizing, stops) = (ok_sizing(), ok_stops());
        let mut context = ctx(&intent, &sizing, &stops);
        context.cluster_risk = dec!(490); // + 36.99 > 5% of 10k
        let (_, reason) = standard().run(&context).unwrap_err();
        assert_eq!(reason, RejectReason::CorrelationCap);
    }

    #[test]
    fn test_cluster_map() {
        assert_eq!(cluster_of("BTC/USDT"), "large_cap");
        assert_eq!(cluster_of("ETH/USDT"), "large_cap");
        assert_eq!(cluster_of("SOL/USDT"), "mid_cap");
        assert_eq!(cluster_of("DOGE/USDT"), "small_cap");
    }
}
