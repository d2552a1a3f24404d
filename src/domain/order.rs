use crate::domain::types::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::StopLoss => write!(f, "STOP_LOSS"),
            OrderKind::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// Order lifecycle states. Transitions are forward-only; see [`OrderStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }

    /// Rank in the forward-only ordering. Terminal states share the top rank;
    /// once terminal, no further transition is legal.
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Open => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed => 3,
        }
    }

    pub fn can_transition(&self, to: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to.rank() > self.rank() || (to.rank() == self.rank() && *self != to)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "OPEN" => Ok(OrderStatus::Open),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "FAILED" => Ok(OrderStatus::Failed),
            _ => anyhow::bail!("Invalid order status: {}", s),
        }
    }
}

/// A fully-specified order approved by RiskManager, consumed by Execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedOrder {
    pub order_id: Uuid,
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub expected_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Funds held against the account until a terminal order status resolves them.
    pub reserved_usd: Decimal,
}

/// Persistent record of an order placed on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub quantity: Decimal,
    /// Limit / trigger price; None for market orders.
    pub price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Orders carry the position id; the reverse lookup goes through the index.
    pub position_id: Option<Uuid>,
    /// Unix millis.
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrderRecord {
    /// Applies a forward-only status transition.
    pub fn transition(&mut self, to: OrderStatus, now: i64) -> anyhow::Result<()> {
        if !self.status.can_transition(to) {
            anyhow::bail!(
                "illegal order status transition {} -> {} for order {}",
                self.status,
                to,
                self.order_id
            );
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Published on `order.status` for every order state change.
///
/// `intent_id` and `realized_pnl` are optional forward-compatible fields;
/// Strategy uses them to close its adaptive-weight feedback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
    /// Unix millis.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(status: OrderStatus) -> OrderRecord {
        OrderRecord {
            order_id: Uuid::new_v4(),
            exchange_order_id: None,
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            status,
            quantity: dec!(1),
            price: None,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            position_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_forward_only_transitions() {
        let mut r = record(OrderStatus::Pending);
        r.transition(OrderStatus::Open, 1).unwrap();
        r.transition(OrderStatus::PartiallyFilled, 2).unwrap();
        r.transition(OrderStatus::Filled, 3).unwrap();

        // Terminal states never transition again.
        assert!(r.transition(OrderStatus::Cancelled, 4).is_err());
        assert!(r.transition(OrderStatus::Open, 5).is_err());
    }

    #[test]
    fn test_no_downgrade() {
        let mut r = record(OrderStatus::PartiallyFilled);
        assert!(r.transition(OrderStatus::Pending, 1).is_err());
        assert!(r.transition(OrderStatus::Open, 1).is_err());
        assert_eq!(r.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut r = record(OrderStatus::Pending);
        r.transition(OrderStatus::Failed, 1).unwrap();
        assert!(r.status.is_terminal());
    }
}
