//! Position reduction when a venue signals the book must shrink.
//!
//! Selection runs in two passes over the funding rows:
//! 1. loss-first: every hedged pair whose base leg sits on the losing side
//!    of the funding differential (deny-listed tokens always qualify)
//! 2. profit-ranked, only when pass 1 accepted nothing: hedged pairs in
//!    ascending `|total|`, so the least profitable carry goes first
//!
//! Both passes stop at `max_close_per_cycle` and reduce a token at most once.

use anyhow::Result;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::executor::{OrderExecutor, OrderIntent};
use super::funding::FundingFeeRow;
use super::pair::PairMarket;
use crate::config::{KeeperConfig, TunableParams};
use crate::exchange::VenueSet;
use crate::notify::{AlertDispatcher, AlertKind};
use crate::risk::RiskSnapshot;
use crate::store::OrderBookCache;

/// Which pass produced the intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducePass {
    LossFirst,
    ProfitRanked,
}

/// Outcome of candidate selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceSelection {
    pub pass: ReducePass,
    pub intents: Vec<OrderIntent>,
}

/// Shrinks hedged pairs in funding-loss order.
pub struct PositionReducer {
    venues: VenueSet,
    books: OrderBookCache,
    executor: Arc<OrderExecutor>,
    alerts: Arc<AlertDispatcher>,
    order_usd: Decimal,
    percent_usd_cap: Decimal,
}

impl PositionReducer {
    pub fn new(
        venues: VenueSet,
        books: OrderBookCache,
        executor: Arc<OrderExecutor>,
        alerts: Arc<AlertDispatcher>,
        config: &KeeperConfig,
    ) -> Self {
        Self {
            venues,
            books,
            executor,
            alerts,
            order_usd: config.order_usd,
            percent_usd_cap: config.percent_usd_cap,
        }
    }

    /// Select and execute reductions. `percent` requests a fixed-fraction cut
    /// that ignores the spread.
    ///
    /// Returns the executed intents; empty when nothing qualified, in which
    /// case a rate-limited alert is sent.
    #[instrument(skip_all, name = "decrease", fields(percent = ?percent))]
    pub async fn run(
        &self,
        snapshot: &RiskSnapshot,
        rows: &[FundingFeeRow],
        tunables: &TunableParams,
        percent: Option<Decimal>,
    ) -> Result<Vec<OrderIntent>> {
        let selection = self.select(snapshot, rows, tunables, percent).await;

        if selection.intents.is_empty() {
            let (kind, text) = match percent {
                Some(p) => (
                    AlertKind::NoDecreasePercent,
                    format!("[DECREASE] Leverage requires a {}% cut but no position could be reduced", (p * dec!(100)).normalize()),
                ),
                None => (
                    AlertKind::NoDecreaseFunding,
                    "[DECREASE] Leverage requires a cut but no pair clears the decrease spread".to_string(),
                ),
            };
            info!(pass = ?selection.pass, "{}", text);
            self.alerts.alert(kind, &text).await;
            return Ok(Vec::new());
        }

        for intent in &selection.intents {
            info!(
                token = %intent.token,
                base = %self.venues.name(intent.base),
                quote = %self.venues.name(intent.quote),
                direction = %intent.direction,
                qty = %intent.quantity,
                pass = ?selection.pass,
                "[DECREASE] Reducing pair"
            );
        }

        self.executor.execute_batch("decrease", &selection.intents).await?;
        Ok(selection.intents)
    }

    /// Two-pass candidate selection without side effects.
    pub async fn select(
        &self,
        snapshot: &RiskSnapshot,
        rows: &[FundingFeeRow],
        tunables: &TunableParams,
        percent: Option<Decimal>,
    ) -> ReduceSelection {
        let cap = tunables.max_close_per_cycle as usize;

        let losing: Vec<&FundingFeeRow> = rows
            .iter()
            .filter(|row| {
                held_base_direction(snapshot, row).map_or(false, |dir| {
                    row.is_losing(dir) || tunables.is_denied(&row.token)
                })
            })
            .collect();
        let intents = self.collect(snapshot, &losing, tunables, percent, cap).await;
        if !intents.is_empty() {
            return ReduceSelection {
                pass: ReducePass::LossFirst,
                intents,
            };
        }

        let mut ranked: Vec<&FundingFeeRow> = rows.iter().collect();
        ranked.sort_by(|a, b| a.total.abs().cmp(&b.total.abs()));
        let intents = self.collect(snapshot, &ranked, tunables, percent, cap).await;
        ReduceSelection {
            pass: ReducePass::ProfitRanked,
            intents,
        }
    }

    /// Candidates are loaded concurrently, then accepted in row order.
    async fn collect(
        &self,
        snapshot: &RiskSnapshot,
        rows: &[&FundingFeeRow],
        tunables: &TunableParams,
        percent: Option<Decimal>,
        cap: usize,
    ) -> Vec<OrderIntent> {
        let candidates = join_all(
            rows.iter()
                .map(|row| self.candidate(snapshot, row, tunables, percent)),
        )
        .await;

        let mut intents = Vec::new();
        let mut seen = HashSet::new();
        for (row, candidate) in rows.iter().zip(candidates) {
            if intents.len() >= cap {
                break;
            }
            if seen.contains(&row.token) {
                continue;
            }
            if let Some(intent) = candidate {
                seen.insert(row.token.clone());
                intents.push(intent);
            }
        }
        intents
    }

    /// Build one reduction for a hedged pair, or `None` when the data or the
    /// spread does not allow it.
    async fn candidate(
        &self,
        snapshot: &RiskSnapshot,
        row: &FundingFeeRow,
        tunables: &TunableParams,
        percent: Option<Decimal>,
    ) -> Option<OrderIntent> {
        let (base_leg, quote_leg) = snapshot.row(&row.token)?.hedged_legs(row.base, row.quote)?;
        let direction = base_leg.direction()?.inverse();

        let market = PairMarket::load(
            &self.venues,
            &self.books,
            &row.token,
            (row.base, base_leg),
            (row.quote, quote_leg),
        )
        .await?;

        let Some(price) = market.base_price(direction) else {
            debug!(token = %row.token, %direction, "[DECREASE] No usable top of book");
            return None;
        };

        let smaller_leg = base_leg.size().min(quote_leg.size());
        let quantity = match percent {
            Some(p) => (base_leg.size() * p)
                .max(self.percent_usd_cap / price)
                .min(smaller_leg * dec!(2)),
            None => {
                let Some(delta) = market.delta(direction) else {
                    debug!(token = %row.token, "[DECREASE] No spread available");
                    return None;
                };
                if delta < tunables.min_decrease_delta_bps {
                    debug!(
                        token = %row.token,
                        delta = %delta.round_dp(2),
                        min = %tunables.min_decrease_delta_bps,
                        "[DECREASE] Spread below decrease threshold"
                    );
                    return None;
                }
                (self.order_usd / price).min(smaller_leg)
            }
        };

        market.intent(direction, quantity)
    }
}

/// Base-leg direction of a pair currently hedged on both venues.
fn held_base_direction(
    snapshot: &RiskSnapshot,
    row: &FundingFeeRow,
) -> Option<crate::exchange::Direction> {
    let (base_leg, _) = snapshot.row(&row.token)?.hedged_legs(row.base, row.quote)?;
    base_leg.direction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::exchange::{BookLevel, Direction, MockExchange, OrderBook, VenueId};
    use crate::notify::MockNotifier;
    use crate::risk::RiskAggregator;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    struct Harness {
        a: Arc<MockExchange>,
        b: Arc<MockExchange>,
        venues: VenueSet,
        books: OrderBookCache,
    }

    async fn harness() -> Harness {
        let a = Arc::new(MockExchange::new("BINANCE"));
        let b = Arc::new(MockExchange::new("OKX"));
        let venues = VenueSet::new(vec![a.clone(), b.clone()]);
        let books = OrderBookCache::new(Arc::new(MemoryStore::new()), "FUNDING", Duration::from_secs(5));
        Harness { a, b, venues, books }
    }

    impl Harness {
        async fn hold(&self, token: &str, base_amount: Decimal, price: Decimal) {
            self.a.set_position(token, base_amount, 5).await;
            self.b.set_position(token, -base_amount, 5).await;
            self.a.set_index_price(token, price).await;
            let book = OrderBook {
                update_time: Utc::now().timestamp_millis(),
                bids: vec![BookLevel(price, dec!(10))],
                asks: vec![BookLevel(price, dec!(10))],
            };
            let symbol = format!("{}USDT", token);
            self.books.put("BINANCE", &symbol, &book).await.unwrap();
            self.books.put("OKX", &symbol, &book).await.unwrap();
        }

        fn reducer(&self, notifier: MockNotifier) -> PositionReducer {
            let executor = Arc::new(OrderExecutor::new(
                self.venues.clone(),
                ExecutionConfig {
                    poll_interval_ms: 1,
                    poll_retries: 2,
                    jitter_min_ms: 0,
                    jitter_max_ms: 0,
                },
            ));
            let alerts = Arc::new(AlertDispatcher::new(Arc::new(notifier), "ops"));
            PositionReducer::new(
                self.venues.clone(),
                self.books.clone(),
                executor,
                alerts,
                &KeeperConfig::default(),
            )
        }

        async fn snapshot(&self) -> RiskSnapshot {
            RiskAggregator::new(self.venues.clone()).snapshot().await.unwrap()
        }
    }

    fn funding_row(token: &str, total: Decimal) -> FundingFeeRow {
        FundingFeeRow {
            token: token.into(),
            base: VenueId(0),
            quote: VenueId(1),
            base_rate: Decimal::ZERO,
            quote_rate: Decimal::ZERO,
            base_annual: Decimal::ZERO,
            quote_annual: Decimal::ZERO,
            total,
            next_funding_time: None,
        }
    }

    #[tokio::test]
    async fn test_losing_pair_selected_first_and_suppresses_ranking() {
        let h = harness().await;
        // BTC: base SHORT against total +8, losing; ETH: base LONG with total +3, earning
        h.hold("BTC", dec!(-1), dec!(50000)).await;
        h.hold("ETH", dec!(10), dec!(2000)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("BTC", dec!(8)), funding_row("ETH", dec!(3))];

        let reducer = h.reducer(MockNotifier::new());
        let selection = reducer
            .select(&snapshot, &rows, &TunableParams::default(), Some(dec!(0.2)))
            .await;

        assert_eq!(selection.pass, ReducePass::LossFirst);
        assert_eq!(selection.intents.len(), 1);
        let intent = &selection.intents[0];
        assert_eq!(intent.token, "BTC");
        assert_eq!(intent.direction, Direction::Long);
        // max(1 × 0.2, 500 / 50000) = 0.2
        assert_eq!(intent.quantity, dec!(0.2));
    }

    #[tokio::test]
    async fn test_profit_ranked_when_nothing_is_losing() {
        let h = harness().await;
        h.hold("BTC", dec!(1), dec!(50000)).await;
        h.hold("ETH", dec!(10), dec!(2000)).await;
        h.hold("SOL", dec!(100), dec!(100)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![
            funding_row("BTC", dec!(12)),
            funding_row("SOL", dec!(7)),
            funding_row("ETH", dec!(2)),
        ];
        let mut tunables = TunableParams::default();
        tunables.max_close_per_cycle = 2;

        let reducer = h.reducer(MockNotifier::new());
        let selection = reducer.select(&snapshot, &rows, &tunables, Some(dec!(0.1))).await;

        assert_eq!(selection.pass, ReducePass::ProfitRanked);
        let tokens: Vec<_> = selection.intents.iter().map(|i| i.token.as_str()).collect();
        assert_eq!(tokens, vec!["ETH", "SOL"]);
    }

    #[tokio::test]
    async fn test_denied_token_is_always_loss_first() {
        let h = harness().await;
        h.hold("LUNA", dec!(100), dec!(1)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("LUNA", dec!(50))];
        let mut tunables = TunableParams::default();
        tunables.deny_tokens = vec!["LUNA".into()];

        let selection = h
            .reducer(MockNotifier::new())
            .select(&snapshot, &rows, &tunables, Some(dec!(0.2)))
            .await;
        assert_eq!(selection.pass, ReducePass::LossFirst);
        // max(100 × 0.2, 500 / 1) clamped to 2 × 100
        assert_eq!(selection.intents[0].quantity, dec!(200));
    }

    #[tokio::test]
    async fn test_spread_gate_without_percent() {
        let h = harness().await;
        h.hold("BTC", dec!(-1), dec!(50000)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("BTC", dec!(8))];
        let reducer = h.reducer(MockNotifier::new());

        // Locked books give a zero spread, above the default -5 bps gate
        let selection = reducer.select(&snapshot, &rows, &TunableParams::default(), None).await;
        assert_eq!(selection.intents.len(), 1);
        // 200 USD / 50000
        assert_eq!(selection.intents[0].quantity, dec!(0.004));

        let mut strict = TunableParams::default();
        strict.min_decrease_delta_bps = dec!(1);
        let selection = reducer.select(&snapshot, &rows, &strict, None).await;
        assert!(selection.intents.is_empty());
    }

    #[tokio::test]
    async fn test_spread_path_never_exceeds_smaller_leg() {
        let h = harness().await;
        h.hold("BTC", dec!(-0.001), dec!(50000)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("BTC", dec!(8))];

        let executed = h
            .reducer(MockNotifier::new())
            .run(&snapshot, &rows, &TunableParams::default(), None)
            .await
            .unwrap();

        // 200 USD / 50000 = 0.004, held to the 0.001 leg so neither side flips
        assert_eq!(executed[0].quantity, dec!(0.001));
        assert_eq!(h.a.position("BTC").await, Decimal::ZERO);
        assert_eq!(h.b.position("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_nothing_to_reduce_alerts_once() {
        let h = harness().await;
        h.a.set_position("BTC", dec!(1), 5).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("BTC", dec!(8))];

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|_, text| text.contains("20%"))
            .times(1)
            .returning(|_, _| Ok(()));
        let reducer = h.reducer(notifier);

        for _ in 0..2 {
            let executed = reducer
                .run(&snapshot, &rows, &TunableParams::default(), Some(dec!(0.2)))
                .await
                .unwrap();
            assert!(executed.is_empty());
        }
    }

    #[tokio::test]
    async fn test_run_executes_selected_pairs() {
        let h = harness().await;
        h.hold("BTC", dec!(-1), dec!(50000)).await;
        let snapshot = h.snapshot().await;
        let rows = vec![funding_row("BTC", dec!(8))];

        let executed = h
            .reducer(MockNotifier::new())
            .run(&snapshot, &rows, &TunableParams::default(), Some(dec!(0.2)))
            .await
            .unwrap();

        assert_eq!(executed.len(), 1);
        assert_eq!(h.a.position("BTC").await, dec!(-0.8));
        assert_eq!(h.b.position("BTC").await, dec!(0.8));
    }
}
