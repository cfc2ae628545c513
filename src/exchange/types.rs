//! Venue-neutral types exchanged with exchange adapters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::decimal::snap_quantity;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of a hedge relative to its base venue.
///
/// `Long` buys on the base venue and sells on the quote venue; `Short` is the
/// mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Direction of a signed position amount. Zero has no direction.
    pub fn of(amount: Decimal) -> Option<Self> {
        if amount > Decimal::ZERO {
            Some(Direction::Long)
        } else if amount < Decimal::ZERO {
            Some(Direction::Short)
        } else {
            None
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Order side that moves a position in this direction.
    pub fn side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// One `[price, qty]` level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel(pub Decimal, pub Decimal);

impl BookLevel {
    pub fn price(&self) -> Decimal {
        self.0
    }

    pub fn qty(&self) -> Decimal {
        self.1
    }
}

/// Cached order book snapshot as written by the market-data collectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Milliseconds since epoch of the last update
    #[serde(rename = "updatetime")]
    pub update_time: i64,
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Best bid price, if the bid side is not empty.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(BookLevel::price)
    }

    /// Best ask price, if the ask side is not empty.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(BookLevel::price)
    }

    /// Top price a taker order on `side` would hit.
    pub fn top_for(&self, side: OrderSide) -> Option<Decimal> {
        match side {
            OrderSide::Sell => self.best_bid(),
            OrderSide::Buy => self.best_ask(),
        }
    }
}

/// Quantity/price precision rules for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QtyFilter {
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub price_precision: u32,
    pub qty_precision: u32,
}

impl QtyFilter {
    /// The strictest filter satisfying both venues of a pair.
    ///
    /// Assumes the coarser step is a multiple of the finer one, which holds for
    /// the decimal step grids venues publish.
    pub fn merge(&self, other: &QtyFilter) -> QtyFilter {
        QtyFilter {
            min_qty: self.min_qty.max(other.min_qty),
            step_size: self.step_size.max(other.step_size),
            price_precision: self.price_precision.min(other.price_precision),
            qty_precision: self.qty_precision.min(other.qty_precision),
        }
    }

    /// Floor `quantity` to the step grid; below `min_qty` becomes zero.
    pub fn snap(&self, quantity: Decimal) -> Decimal {
        snap_quantity(quantity, self.min_qty, self.step_size)
    }
}

/// Account-level figures for one venue.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Total equity in USD (wallet balance + unrealized PnL)
    pub equity: Decimal,
    /// Balance available for new margin
    pub available: Decimal,
}

/// An open position as reported by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    /// Normalized token name (e.g. "BTC")
    pub token: String,
    /// Venue-local symbol (e.g. "BTCUSDT")
    pub symbol: String,
    /// Signed position amount: positive = long, negative = short
    pub amount: Decimal,
    pub leverage: u32,
}

/// Current funding information for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    /// Funding rate for the current interval
    pub rate: Decimal,
    /// Milliseconds since epoch of the next funding settlement
    pub next_funding_time: i64,
}

/// Status of a previously placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    pub is_completed: bool,
    pub executed_qty: Decimal,
}

/// A venue's verdict on whether the book must shrink this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecreaseSignal {
    None,
    /// Reduce positions when the spread allows it
    Decrease,
    /// Reduce by the given fraction regardless of spread
    DecreasePercent(Decimal),
}

impl DecreaseSignal {
    fn rank(&self) -> u8 {
        match self {
            DecreaseSignal::None => 0,
            DecreaseSignal::Decrease => 1,
            DecreaseSignal::DecreasePercent(_) => 2,
        }
    }

    /// The more urgent of two signals. Between two percent signals the larger
    /// fraction wins.
    pub fn max(self, other: DecreaseSignal) -> DecreaseSignal {
        match (self, other) {
            (DecreaseSignal::DecreasePercent(a), DecreaseSignal::DecreasePercent(b)) => {
                DecreaseSignal::DecreasePercent(a.max(b))
            }
            (a, b) if b.rank() > a.rank() => b,
            (a, _) => a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_book_deserializes_cache_shape() {
        let raw = r#"{"updatetime":1700000000000,"bids":[["100.5","2"],["100.4","1"]],"asks":[["100.6","3"]]}"#;
        let book: OrderBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.update_time, 1_700_000_000_000);
        assert_eq!(book.best_bid(), Some(dec!(100.5)));
        assert_eq!(book.best_ask(), Some(dec!(100.6)));
        assert_eq!(book.top_for(OrderSide::Sell), Some(dec!(100.5)));
        assert_eq!(book.top_for(OrderSide::Buy), Some(dec!(100.6)));
    }

    #[test]
    fn test_empty_side_has_no_top() {
        let raw = r#"{"updatetime":1,"bids":[],"asks":[["1","1"]]}"#;
        let book: OrderBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_direction_of_amount() {
        assert_eq!(Direction::of(dec!(0.1)), Some(Direction::Long));
        assert_eq!(Direction::of(dec!(-2)), Some(Direction::Short));
        assert_eq!(Direction::of(Decimal::ZERO), None);
        assert_eq!(Direction::Long.inverse().side(), OrderSide::Sell);
    }

    #[test]
    fn test_filter_merge_takes_strictest() {
        let a = QtyFilter {
            min_qty: dec!(0.001),
            step_size: dec!(0.001),
            price_precision: 2,
            qty_precision: 3,
        };
        let b = QtyFilter {
            min_qty: dec!(0.01),
            step_size: dec!(0.01),
            price_precision: 1,
            qty_precision: 2,
        };
        let merged = a.merge(&b);
        assert_eq!(merged.min_qty, dec!(0.01));
        assert_eq!(merged.step_size, dec!(0.01));
        assert_eq!(merged.snap(dec!(0.1234)), dec!(0.12));
    }

    #[test]
    fn test_signal_max_prefers_urgent() {
        let pct = DecreaseSignal::DecreasePercent(dec!(0.2));
        assert_eq!(DecreaseSignal::None.max(DecreaseSignal::Decrease), DecreaseSignal::Decrease);
        assert_eq!(DecreaseSignal::Decrease.max(pct), pct);
        assert_eq!(pct.max(DecreaseSignal::None), pct);
        assert_eq!(
            DecreaseSignal::DecreasePercent(dec!(0.1)).max(pct),
            pct
        );
    }
}
