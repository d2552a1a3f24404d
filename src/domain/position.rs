use crate::domain::types::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_entry_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    /// Side of the order that reduces or closes this position.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(PositionSide::Long),
            "SHORT" => Ok(PositionSide::Short),
            _ => anyhow::bail!("Invalid position side: {}", s),
        }
    }
}

/// Persisted position status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
            PositionStatus::Liquidated => write!(f, "LIQUIDATED"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "LIQUIDATED" => Ok(PositionStatus::Liquidated),
            _ => anyhow::bail!("Invalid position status: {}", s),
        }
    }
}

/// Runtime lifecycle state driven by Execution. Only OPEN/CLOSED are persisted
/// (via [`PositionStatus`]); the rest exist between fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    None,
    Opening,
    Open,
    Reducing,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (None, Opening)
                | (Opening, Open)
                | (Opening, None)
                | (Open, Reducing)
                | (Reducing, Open)
                | (Reducing, Closing)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

/// A position held on an exchange. At most one OPEN position exists per
/// (exchange, symbol); Execution's per-symbol lock enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_entry: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub status: PositionStatus,
    /// Unix millis.
    pub opened_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    /// Intent that opened the position; carried through for the feedback loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
}

impl Position {
    /// Unrealized PnL at `price`. LONG: (price - entry) * qty; SHORT symmetric.
    pub fn unrealized_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.avg_entry) * self.quantity,
            PositionSide::Short => (self.avg_entry - price) * self.quantity,
        }
    }

    /// Refreshes current price and the derived unrealized PnL.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = self.unrealized_at(price);
    }

    /// Reduces the position by `qty` filled at `price`, accruing realized PnL
    /// with the remaining-basis method (entry basis unchanged on reductions).
    /// Returns the PnL realized by this reduction.
    pub fn reduce(&mut self, qty: Decimal, price: Decimal, now: i64) -> Decimal {
        let qty = qty.min(self.quantity);
        let realized = match self.side {
            PositionSide::Long => (price - self.avg_entry) * qty,
            PositionSide::Short => (self.avg_entry - price) * qty,
        };
        self.quantity -= qty;
        self.realized_pnl += realized;
        if self.quantity.is_zero() {
            self.status = PositionStatus::Closed;
            self.closed_at = Some(now);
            self.unrealized_pnl = Decimal::ZERO;
        } else {
            self.mark(price);
        }
        realized
    }

    /// Folds a (possibly partial) entry fill into the running average entry.
    pub fn add_fill(&mut self, qty: Decimal, price: Decimal) {
        let total_cost = self.avg_entry * self.quantity + price * qty;
        let new_qty = self.quantity + qty;
        if !new_qty.is_zero() {
            self.avg_entry = total_cost / new_qty;
        }
        self.quantity = new_qty;
    }

    /// Risk currently at stake: distance to stop times quantity.
    pub fn risk_usd(&self) -> Decimal {
        (self.avg_entry - self.stop_loss).abs() * self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long(qty: Decimal, entry: Decimal) -> Position {
        Position {
            id: Uuid::new_v4(),
            exchange: "paper".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
            quantity: qty,
            avg_entry: entry,
            current_price: entry,
            stop_loss: entry - dec!(3000),
            take_profit: entry + dec!(6000),
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: 0,
            closed_at: None,
            intent_id: None,
        }
    }

    #[test]
    fn test_long_unrealized_pnl() {
        let p = long(dec!(0.5), dec!(120000));
        assert_eq!(p.unrealized_at(dec!(121000)), dec!(500));
        assert_eq!(p.unrealized_at(dec!(119000)), dec!(-500));
    }

    #[test]
    fn test_short_unrealized_pnl() {
        let mut p = long(dec!(0.5), dec!(120000));
        p.side = PositionSide::Short;
        assert_eq!(p.unrealized_at(dec!(119000)), dec!(500));
    }

    #[test]
    fn test_reduce_remaining_basis() {
        let mut p = long(dec!(1), dec!(100));
        let realized = p.reduce(dec!(0.4), dec!(110), 1);
        assert_eq!(realized, dec!(4));
        assert_eq!(p.quantity, dec!(0.6));
        // Basis is unchanged by a reduction.
        assert_eq!(p.avg_entry, dec!(100));
        assert_eq!(p.status, PositionStatus::Open);

        let realized = p.reduce(dec!(0.6), dec!(90), 2);
        assert_eq!(realized, dec!(-6));
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.realized_pnl, dec!(-2));
        assert_eq!(p.closed_at, Some(2));
    }

    #[test]
    fn test_full_close_pnl_matches_fill_sum() {
        // Open with two partial fills, close fully; realized equals
        // (exit - avg_entry) * qty computed from recorded fills.
        let mut p = long(Decimal::ZERO, Decimal::ZERO);
        p.add_fill(dec!(0.4), dec!(100));
        p.add_fill(dec!(0.6), dec!(110));
        assert_eq!(p.avg_entry, dec!(106));

        let realized = p.reduce(dec!(1), dec!(120), 1);
        assert_eq!(realized, dec!(14));
        assert_eq!(p.realized_pnl, dec!(14));
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(None.can_transition(Opening));
        assert!(Opening.can_transition(Open));
        assert!(Open.can_transition(Closing));
        assert!(Closing.can_transition(Closed));
        assert!(Reducing.can_transition(Open));

        assert!(!Closed.can_transition(Open));
        assert!(!None.can_transition(Open));
        assert!(!Open.can_transition(Opening));
    }
}
