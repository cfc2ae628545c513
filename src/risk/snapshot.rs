//! Point-in-time picture of the book across all venues.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::exchange::{AccountInfo, Direction, VenueId};

/// One venue's open position in one token.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    /// Venue-local symbol
    pub symbol: String,
    /// Signed amount: positive = long, negative = short
    pub amount: Decimal,
    pub leverage: u32,
    /// Absolute notional at the token's index price; zero without a price
    pub notional: Decimal,
}

impl ExchangePosition {
    pub fn direction(&self) -> Option<Direction> {
        Direction::of(self.amount)
    }

    /// Absolute position size.
    pub fn size(&self) -> Decimal {
        self.amount.abs()
    }
}

/// A token's positions across venues.
///
/// Keyed by venue ordinal so iteration follows configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPositionRow {
    pub token: String,
    pub positions: BTreeMap<VenueId, ExchangePosition>,
    /// Authoritative index price for this cycle
    pub index_price: Option<Decimal>,
    /// Sum of absolute notionals across venues
    pub notional: Decimal,
}

impl TokenPositionRow {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            positions: BTreeMap::new(),
            index_price: None,
            notional: Decimal::ZERO,
        }
    }

    pub fn get(&self, venue: VenueId) -> Option<&ExchangePosition> {
        self.positions.get(&venue)
    }

    /// Whether `base` and `quote` both hold this token in opposite directions.
    pub fn is_hedged(&self, base: VenueId, quote: VenueId) -> bool {
        match (self.get(base), self.get(quote)) {
            (Some(b), Some(q)) => match (b.direction(), q.direction()) {
                (Some(bd), Some(qd)) => bd != qd,
                _ => false,
            },
            _ => false,
        }
    }

    /// Both legs of a hedged pair.
    pub fn hedged_legs(
        &self,
        base: VenueId,
        quote: VenueId,
    ) -> Option<(&ExchangePosition, &ExchangePosition)> {
        if self.is_hedged(base, quote) {
            Some((self.get(base)?, self.get(quote)?))
        } else {
            None
        }
    }
}

/// One venue's aggregate exposure this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExchangeRiskInfo {
    /// Notional of long positions
    pub positive_notional: Decimal,
    /// Notional of short positions, as a magnitude
    pub negative_notional: Decimal,
    /// `positive_notional + negative_notional`
    pub total_notional: Decimal,
    /// Tokens with nonzero notional on this venue
    pub token_count: u32,
}

impl ExchangeRiskInfo {
    /// Fold one position's absolute notional into the rollup.
    pub fn record(&mut self, direction: Direction, notional: Decimal) {
        match direction {
            Direction::Long => self.positive_notional += notional,
            Direction::Short => self.negative_notional += notional,
        }
        self.total_notional = self.positive_notional + self.negative_notional;
        if notional != Decimal::ZERO {
            self.token_count += 1;
        }
    }
}

/// One cycle's full picture.
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub accounts: BTreeMap<VenueId, AccountInfo>,
    pub total_equity: Decimal,
    pub rows: BTreeMap<String, TokenPositionRow>,
    pub exposure: BTreeMap<VenueId, ExchangeRiskInfo>,
    pub taken_at: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn row(&self, token: &str) -> Option<&TokenPositionRow> {
        self.rows.get(token)
    }

    /// Venue leverage as total notional over equity.
    pub fn leverage(&self, venue: VenueId) -> Option<Decimal> {
        let equity = self.accounts.get(&venue)?.equity;
        let exposure = self.exposure.get(&venue)?;
        if equity <= Decimal::ZERO {
            return None;
        }
        Some(exposure.total_notional / equity)
    }

    /// Gross notional across all venues.
    pub fn gross_notional(&self) -> Decimal {
        self.exposure.values().map(|e| e.total_notional).sum()
    }
}
