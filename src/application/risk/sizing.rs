//! Position sizing. Four methods; production default is Hybrid, which takes
//! the smaller of the Kelly and fixed-fractional sizes and then applies the
//! account-tier ceiling.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    Kelly,
    FixedFractional,
    Volatility,
    Hybrid,
}

impl FromStr for SizingMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kelly" => Ok(SizingMethod::Kelly),
            "fixed" | "fixed_fractional" => Ok(SizingMethod::FixedFractional),
            "volatility" => Ok(SizingMethod::Volatility),
            "hybrid" => Ok(SizingMethod::Hybrid),
            _ => anyhow::bail!("Invalid sizing method: {}", s),
        }
    }
}

/// Position-size ceiling as a fraction of balance, stepped by account size.
/// Small accounts must be allowed to clear exchange minimums; large accounts
/// are held to tighter concentration so concurrent symbols cannot sum past
/// the balance.
#[derive(Debug, Clone, Copy)]
pub struct AccountTiers {
    pub micro_limit: Decimal,
    pub small_limit: Decimal,
    pub micro_pct: Decimal,
    pub small_pct: Decimal,
    pub standard_pct: Decimal,
}

impl Default for AccountTiers {
    fn default() -> Self {
        Self {
            micro_limit: dec!(100),
            small_limit: dec!(1000),
            micro_pct: dec!(0.80),
            small_pct: dec!(0.15),
            standard_pct: dec!(0.10),
        }
    }
}

impl AccountTiers {
    pub fn ceiling_pct(&self, balance: Decimal) -> Decimal {
        if balance < self.micro_limit {
            self.micro_pct
        } else if balance < self.small_limit {
            self.small_pct
        } else {
            self.standard_pct
        }
    }

    pub fn ceiling_usd(&self, balance: Decimal) -> Decimal {
        balance * self.ceiling_pct(balance)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizingConfig {
    pub method: SizingMethod,
    /// Kelly payoff ratio b; mirrors the stop RR.
    pub target_rr: Decimal,
    /// Fraction of balance risked by the fixed-fractional method.
    pub fixed_risk_pct: Decimal,
    /// Fraction of balance risked per trade by the volatility method.
    pub vol_risk_pct: Decimal,
    pub tiers: AccountTiers,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::Hybrid,
            target_rr: dec!(2.0),
            fixed_risk_pct: dec!(0.02),
            vol_risk_pct: dec!(0.01),
            tiers: AccountTiers::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub quantity: Decimal,
    pub size_usd: Decimal,
    pub risk_usd: Decimal,
}

impl Sizing {
    fn from_quantity(quantity: Decimal, price: Decimal, stop_distance: Decimal) -> Self {
        Self {
            quantity,
            size_usd: quantity * price,
            risk_usd: quantity * stop_distance,
        }
    }

    fn from_size(size_usd: Decimal, price: Decimal, stop_distance: Decimal) -> Self {
        let quantity = if price > Decimal::ZERO {
            size_usd / price
        } else {
            Decimal::ZERO
        };
        Self {
            quantity,
            size_usd,
            risk_usd: quantity * stop_distance,
        }
    }
}

/// Kelly fraction f = (b*p - (1-p)) / b, clamped to [0.01, 0.25].
pub fn kelly_fraction(confidence: f64, target_rr: Decimal) -> Decimal {
    let p = Decimal::from_f64_retain(confidence).unwrap_or(Decimal::ZERO);
    let b = target_rr;
    if b <= Decimal::ZERO {
        return dec!(0.01);
    }
    let f = (b * p - (Decimal::ONE - p)) / b;
    f.clamp(dec!(0.01), dec!(0.25))
}

/// Computes the pre-validation sizing for an intent. The caller applies lot
/// rounding and the minimum-lot raise afterwards.
pub fn compute(
    config: &SizingConfig,
    balance: Decimal,
    price: Decimal,
    confidence: f64,
    stop_distance: Decimal,
) -> Sizing {
    if balance <= Decimal::ZERO || price <= Decimal::ZERO || stop_distance <= Decimal::ZERO {
        return Sizing {
            quantity: Decimal::ZERO,
            size_usd: Decimal::ZERO,
            risk_usd: Decimal::ZERO,
        };
    }

    let kelly = || {
        let size = balance * kelly_fraction(confidence, config.target_rr);
        Sizing::from_size(size, price, stop_distance)
    };
    // Fixed fractional risks a fixed slice of the balance against the stop.
    let fixed = || {
        let risk_usd = balance * config.fixed_risk_pct;
        Sizing::from_quantity(risk_usd / stop_distance, price, stop_distance)
    };

    let sizing = match config.method {
        SizingMethod::Kelly => kelly(),
        SizingMethod::FixedFractional => fixed(),
        SizingMethod::Volatility => {
            let risk_usd = balance * config.vol_risk_pct;
            Sizing::from_quantity(risk_usd / stop_distance, price, stop_distance)
        }
        SizingMethod::Hybrid => {
            let (k, f) = (kelly(), fixed());
            if k.size_usd <= f.size_usd { k } else { f }
        }
    };

    // Account-tier ceiling caps notional exposure for every method.
    let ceiling = config.tiers.ceiling_usd(balance);
    if sizing.size_usd > ceiling {
        debug!(
            "Sizing: capped {} -> {} by account tier ({}% of {})",
            sizing.size_usd,
            ceiling,
            config.tiers.ceiling_pct(balance) * dec!(100),
            balance
        );
        return Sizing::from_size(ceiling, price, stop_distance);
    }
    sizing
}

/// Rounds a quantity down to the exchange step size.
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kelly_fraction_clamps() {
        // p=0.7, b=2 -> f = (1.4 - 0.3)/2 = 0.55, clamped to 0.25.
        assert_eq!(kelly_fraction(0.7, dec!(2)), dec!(0.25));
        // p=0.3, b=2 -> f = (0.6 - 0.7)/2 < 0, clamped to 0.01.
        assert_eq!(kelly_fraction(0.3, dec!(2)), dec!(0.01));
        // p=0.4, b=2 -> (0.8 - 0.6)/2 = 0.10.
        assert_eq!(kelly_fraction(0.4, dec!(2)), dec!(0.10));
    }

    #[test]
    fn test_tier_ceilings() {
        let tiers = AccountTiers::default();
        assert_eq!(tiers.ceiling_pct(dec!(84.54)), dec!(0.80));
        assert_eq!(tiers.ceiling_pct(dec!(500)), dec!(0.15));
        assert_eq!(tiers.ceiling_pct(dec!(10000)), dec!(0.10));
    }

    #[test]
    fn test_hybrid_takes_smaller_size_then_ceiling() {
        // Reference numbers: balance 10k, conf 0.70, price 121617, ATR 1500,
        // stop distance 2*ATR = 3000, tier pinned at 15%.
        let config = SizingConfig {
            tiers: AccountTiers {
                standard_pct: dec!(0.15),
                ..Default::default()
            },
            ..Default::default()
        };
        let sizing = compute(&config, dec!(10000), dec!(121617), 0.70, dec!(3000));

        // Kelly size 2500 < fixed size (200/3000 * 121617 ~ 8108); ceiling
        // 1500 binds.
        assert_eq!(sizing.size_usd, dec!(1500));
        let quantity = round_to_step(sizing.quantity, dec!(0.00001));
        assert_eq!(quantity, dec!(0.01233));

        let risk = quantity * dec!(3000);
        assert!(risk <= dec!(100), "per-trade risk {} must stay within 1%", risk);
    }

    #[test]
    fn test_fixed_fractional_risks_fixed_slice() {
        let config = SizingConfig {
            method: SizingMethod::FixedFractional,
            ..Default::default()
        };
        let sizing = compute(&config, dec!(10000), dec!(100), 0.9, dec!(5));
        // risk 2% of 10k = 200; qty = 200/5 = 40; size = 4000 -> ceiling 10%
        // of 10k = 1000 binds.
        assert_eq!(sizing.size_usd, dec!(1000));
        assert_eq!(sizing.quantity, dec!(10));
    }

    #[test]
    fn test_volatility_sizing() {
        let config = SizingConfig {
            method: SizingMethod::Volatility,
            ..Default::default()
        };
        let sizing = compute(&config, dec!(10000), dec!(100), 0.9, dec!(20));
        // risk 1% = 100; qty = 100/20 = 5; size 500 under the ceiling.
        assert_eq!(sizing.quantity, dec!(5));
        assert_eq!(sizing.risk_usd, dec!(100));
    }

    #[test]
    fn test_zero_inputs_zero_sizing() {
        let config = SizingConfig::default();
        let sizing = compute(&config, Decimal::ZERO, dec!(100), 0.9, dec!(20));
        assert_eq!(sizing.quantity, Decimal::ZERO);
        let sizing = compute(&config, dec!(1000), dec!(100), 0.9, Decimal::ZERO);
        assert_eq!(sizing.risk_usd, Decimal::ZERO);
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(0.0123345), dec!(0.00001)), dec!(0.01233));
        assert_eq!(round_to_step(dec!(1.999), dec!(0.5)), dec!(1.5));
        assert_eq!(round_to_step(dec!(2), Decimal::ZERO), dec!(2));
    }
}
