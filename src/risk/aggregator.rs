//! Builds the per-cycle [`RiskSnapshot`] from live venue data.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::{join_all, try_join_all};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use super::snapshot::{ExchangePosition, ExchangeRiskInfo, RiskSnapshot, TokenPositionRow};
use crate::exchange::{AccountInfo, VenueId, VenuePosition, VenueSet};

/// Aggregates positions and exposure across every configured venue.
#[derive(Debug, Clone)]
pub struct RiskAggregator {
    venues: VenueSet,
}

impl RiskAggregator {
    pub fn new(venues: VenueSet) -> Self {
        Self { venues }
    }

    /// Fetch every venue's account and positions and build the snapshot.
    ///
    /// A failing account or position call aborts the snapshot. A token
    /// without an index price keeps zero notional.
    #[instrument(skip(self), name = "risk_snapshot")]
    pub async fn snapshot(&self) -> Result<RiskSnapshot> {
        let fetched = try_join_all(self.venues.iter().map(|(venue, adapter)| async move {
            let (account, positions) = tokio::try_join!(adapter.account_info(), adapter.positions())
                .with_context(|| format!("Failed to fetch account state from {}", adapter.name()))?;
            Ok::<(VenueId, AccountInfo, Vec<VenuePosition>), anyhow::Error>((
                venue, account, positions,
            ))
        }))
        .await?;

        let mut accounts = BTreeMap::new();
        let mut rows: BTreeMap<String, TokenPositionRow> = BTreeMap::new();
        for (venue, account, positions) in fetched {
            accounts.insert(venue, account);
            for position in positions {
                if position.amount == Decimal::ZERO {
                    continue;
                }
                rows.entry(position.token.clone())
                    .or_insert_with(|| TokenPositionRow::new(&position.token))
                    .positions
                    .insert(
                        venue,
                        ExchangePosition {
                            symbol: position.symbol,
                            amount: position.amount,
                            leverage: position.leverage,
                            notional: Decimal::ZERO,
                        },
                    );
            }
        }
        let total_equity: Decimal = accounts.values().map(|a| a.equity).sum();

        let prices = join_all(rows.keys().map(|token| self.index_price(token))).await;

        let mut exposure: BTreeMap<VenueId, ExchangeRiskInfo> = self
            .venues
            .iter()
            .map(|(venue, _)| (venue, ExchangeRiskInfo::default()))
            .collect();

        for (row, price) in rows.values_mut().zip(prices) {
            if price.is_none() {
                warn!(token = %row.token, "No index price available, notional set to zero");
            }
            row.index_price = price;
            row.notional = Decimal::ZERO;
            for (venue, position) in row.positions.iter_mut() {
                position.notional = price.map_or(Decimal::ZERO, |p| position.amount.abs() * p);
                row.notional += position.notional;
                if let (Some(direction), Some(info)) = (position.direction(), exposure.get_mut(venue)) {
                    info.record(direction, position.notional);
                }
            }
        }

        for (venue, info) in &exposure {
            debug!(
                venue = %self.venues.name(*venue),
                long = %info.positive_notional,
                short = %info.negative_notional,
                total = %info.total_notional,
                tokens = info.token_count,
                "Venue exposure"
            );
        }
        info!(
            equity = %total_equity,
            tokens = rows.len(),
            venues = accounts.len(),
            "Risk snapshot built"
        );

        Ok(RiskSnapshot {
            accounts,
            total_equity,
            rows,
            exposure,
            taken_at: Utc::now(),
        })
    }

    /// First positive index price in venue order.
    async fn index_price(&self, token: &str) -> Option<Decimal> {
        for (_, adapter) in self.venues.iter() {
            match adapter.index_price(token).await {
                Ok(Some(price)) if price > Decimal::ZERO => return Some(price),
                Ok(_) => continue,
                Err(e) => {
                    debug!(%token, venue = %adapter.name(), error = %e, "Index price lookup failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn two_venues() -> (Arc<MockExchange>, Arc<MockExchange>, RiskAggregator) {
        let a = Arc::new(MockExchange::new("BINANCE"));
        let b = Arc::new(MockExchange::new("OKX"));
        let venues = VenueSet::new(vec![a.clone(), b.clone()]);
        (a, b, RiskAggregator::new(venues))
    }

    #[tokio::test]
    async fn test_snapshot_builds_rows_and_exposure() {
        let (a, b, aggregator) = two_venues().await;
        a.set_equity(dec!(20000)).await;
        b.set_equity(dec!(30000)).await;
        a.set_position("BTC", dec!(1), 5).await;
        b.set_position("BTC", dec!(-0.4), 5).await;
        b.set_position("ETH", dec!(-2), 5).await;
        a.set_index_price("BTC", dec!(50000)).await;
        b.set_index_price("ETH", dec!(3000)).await;

        let snapshot = aggregator.snapshot().await.unwrap();

        assert_eq!(snapshot.total_equity, dec!(50000));
        let btc = snapshot.row("BTC").unwrap();
        assert_eq!(btc.get(VenueId(0)).unwrap().notional, dec!(50000));
        assert_eq!(btc.get(VenueId(1)).unwrap().notional, dec!(20000));
        assert_eq!(btc.notional, dec!(70000));

        let okx = snapshot.exposure[&VenueId(1)];
        assert_eq!(okx.negative_notional, dec!(26000));
        assert_eq!(okx.token_count, 2);
        for info in snapshot.exposure.values() {
            assert_eq!(info.total_notional, info.positive_notional + info.negative_notional);
        }
        assert_eq!(snapshot.leverage(VenueId(0)), Some(dec!(2.5)));
    }

    #[tokio::test]
    async fn test_index_price_prefers_first_venue() {
        let (a, b, aggregator) = two_venues().await;
        a.set_position("BTC", dec!(1), 5).await;
        a.set_index_price("BTC", dec!(50000)).await;
        b.set_index_price("BTC", dec!(51000)).await;

        let snapshot = aggregator.snapshot().await.unwrap();
        assert_eq!(snapshot.row("BTC").unwrap().index_price, Some(dec!(50000)));
    }

    #[tokio::test]
    async fn test_missing_index_price_degrades_to_zero() {
        let (a, _b, aggregator) = two_venues().await;
        a.set_position("DOGE", dec!(1000), 5).await;

        let snapshot = aggregator.snapshot().await.unwrap();
        let row = snapshot.row("DOGE").unwrap();
        assert_eq!(row.index_price, None);
        assert_eq!(row.notional, Decimal::ZERO);
        assert_eq!(snapshot.exposure[&VenueId(0)].token_count, 0);
    }

    #[tokio::test]
    async fn test_failing_venue_aborts_snapshot() {
        let (_a, b, aggregator) = two_venues().await;
        b.set_fail_account(true).await;

        let err = aggregator.snapshot().await.unwrap_err();
        assert!(err.to_string().contains("OKX"));
    }
}
