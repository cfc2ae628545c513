//! Funding-rate differential per token and venue pair.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, instrument, warn};

use crate::exchange::{Direction, ExchangeAdapter, VenueId, VenueSet};
use crate::risk::RiskSnapshot;

const HOURS_PER_YEAR: Decimal = dec!(8760);

/// One venue's funding for one token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VenueFunding {
    pub rate: Decimal,
    /// `rate × 8760 ÷ interval_hours`
    pub annualized: Decimal,
    pub next_funding_time: i64,
}

/// Funding comparison of one token on a `(base, quote)` venue pair.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingFeeRow {
    pub token: String,
    pub base: VenueId,
    pub quote: VenueId,
    pub base_rate: Decimal,
    pub quote_rate: Decimal,
    pub base_annual: Decimal,
    pub quote_annual: Decimal,
    /// `(base_annual − quote_annual) × 100`
    pub total: Decimal,
    /// Nearer of the two venues' next funding timestamps (ms)
    pub next_funding_time: Option<i64>,
}

impl FundingFeeRow {
    /// Differential seen from a held base leg: positive when holding earns.
    pub fn carry_bps(&self, base_direction: Direction) -> Decimal {
        self.total * base_direction.sign()
    }

    /// Whether a base leg held in `base_direction` is on the losing side.
    pub fn is_losing(&self, base_direction: Direction) -> bool {
        self.carry_bps(base_direction) < Decimal::ZERO
    }
}

/// Ranks funding differentials across every venue pair.
///
/// Each venue's rate and interval are fetched once per token and shared by
/// every pair the venue takes part in.
pub struct FundingAggregator {
    venues: VenueSet,
}

impl FundingAggregator {
    pub fn new(venues: VenueSet) -> Self {
        Self { venues }
    }

    /// Rows for every token in the snapshot, sorted by descending `|total|`.
    #[instrument(skip_all, name = "funding_rank", fields(tokens = snapshot.rows.len()))]
    pub async fn rank(&self, snapshot: &RiskSnapshot) -> Vec<FundingFeeRow> {
        let tokens: Vec<&String> = snapshot.rows.keys().collect();
        let fetched = join_all(tokens.iter().map(|token| self.token_funding(token))).await;

        let pairs = self.venues.pairs();
        let mut rows = Vec::new();
        for (token, slots) in tokens.into_iter().zip(fetched) {
            for &(base, quote) in &pairs {
                let (Some(Some(b)), Some(Some(q))) = (slots.get(base.0), slots.get(quote.0)) else {
                    continue;
                };
                rows.push(FundingFeeRow {
                    token: token.clone(),
                    base,
                    quote,
                    base_rate: b.rate,
                    quote_rate: q.rate,
                    base_annual: b.annualized,
                    quote_annual: q.annualized,
                    total: (b.annualized - q.annualized) * dec!(100),
                    next_funding_time: Some(b.next_funding_time.min(q.next_funding_time)),
                });
            }
        }

        sort_by_magnitude_desc(&mut rows);
        debug!(rows = rows.len(), "Funding rows ranked");
        rows
    }

    /// One slot per venue, in venue order; `None` where funding is unavailable.
    async fn token_funding(&self, token: &str) -> Vec<Option<VenueFunding>> {
        join_all(
            self.venues
                .iter()
                .map(|(_, adapter)| self.venue_funding(adapter.as_ref(), token)),
        )
        .await
    }

    async fn venue_funding(&self, adapter: &dyn ExchangeAdapter, token: &str) -> Option<VenueFunding> {
        let symbol = adapter.exchange_symbol(token)?;

        let (funding, interval) = tokio::join!(
            adapter.current_funding(&symbol),
            adapter.funding_interval_hours(&symbol),
        );
        let snapshot = match funding {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(venue = %adapter.name(), %symbol, error = %e, "Funding rate unavailable");
                return None;
            }
        };
        let hours = match interval {
            Ok(hours) if hours > 0 => hours,
            Ok(_) => {
                warn!(venue = %adapter.name(), %symbol, "Zero funding interval");
                return None;
            }
            Err(e) => {
                warn!(venue = %adapter.name(), %symbol, error = %e, "Funding interval unavailable");
                return None;
            }
        };

        Some(VenueFunding {
            rate: snapshot.rate,
            annualized: snapshot.rate * HOURS_PER_YEAR / Decimal::from(hours),
            next_funding_time: snapshot.next_funding_time,
        })
    }
}

/// Stable sort by descending `|total|`.
pub fn sort_by_magnitude_desc(rows: &mut [FundingFeeRow]) {
    rows.sort_by(|a, b| b.total.abs().cmp(&a.total.abs()));
}
