//! Profit locking on hedged pairs.
//!
//! A hedged pair is partially closed when the live spread for closing it
//! clears a dynamic bar. The bar starts at `max_settle_delta_bps`, is pulled
//! toward `min_settle_delta_bps` by a favourable funding differential, and
//! decays to the minimum as the pair's holding time approaches
//! `max_holding_hours`. Close to the next funding settlement the bar snaps to
//! an extreme: the minimum when the held side pays funding, the maximum when
//! it receives.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::executor::{OrderExecutor, OrderIntent};
use super::funding::FundingFeeRow;
use super::pair::PairMarket;
use crate::config::{KeeperConfig, TunableParams};
use crate::exchange::{VenueId, VenueSet};
use crate::notify::AlertDispatcher;
use crate::risk::{RiskSnapshot, TokenPositionRow};
use crate::store::{OrderBookCache, PositionClock};
use crate::utils::decimal::clamp;

/// Fraction of the max holding window already elapsed, in `[0, 1]`.
pub fn hold_ratio(hold_ms: i64, max_holding_ms: i64) -> Decimal {
    if max_holding_ms <= 0 {
        return Decimal::ONE;
    }
    clamp(
        Decimal::from(hold_ms) / Decimal::from(max_holding_ms),
        Decimal::ZERO,
        Decimal::ONE,
    )
}

/// Spread (bps) a pair must clear to be locked.
///
/// `funding_diff_bps` is the differential seen from the held side; negative
/// values lower the starting bar.
pub fn required_delta(min: Decimal, max: Decimal, funding_diff_bps: Decimal, hold_ratio: Decimal) -> Decimal {
    let range = max - min;
    let starting = clamp(max + clamp(funding_diff_bps, -range, range), min, max);
    let ratio = clamp(hold_ratio, Decimal::ZERO, Decimal::ONE);
    min + (starting - min) * (Decimal::ONE - ratio)
}

/// Threshold override inside the window before the next funding settlement.
pub fn funding_override(
    min: Decimal,
    max: Decimal,
    carry_bps: Decimal,
    next_funding_ms: Option<i64>,
    now_ms: i64,
    window_ms: i64,
) -> Option<Decimal> {
    let until = next_funding_ms? - now_ms;
    if until < 0 || until > window_ms || carry_bps == Decimal::ZERO {
        return None;
    }
    Some(if carry_bps < Decimal::ZERO { min } else { max })
}

/// One locked pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledPair {
    pub intent: OrderIntent,
    pub delta_bps: Decimal,
    pub threshold_bps: Decimal,
}

/// Locks profit on hedged pairs whose spread clears the dynamic bar.
pub struct SettlementEngine {
    venues: VenueSet,
    books: OrderBookCache,
    clock: PositionClock,
    executor: Arc<OrderExecutor>,
    alerts: Arc<AlertDispatcher>,
    order_usd: Decimal,
    max_holding_ms: i64,
    override_window_ms: i64,
}

impl SettlementEngine {
    pub fn new(
        venues: VenueSet,
        books: OrderBookCache,
        clock: PositionClock,
        executor: Arc<OrderExecutor>,
        alerts: Arc<AlertDispatcher>,
        config: &KeeperConfig,
    ) -> Self {
        Self {
            venues,
            books,
            clock,
            executor,
            alerts,
            order_usd: config.order_usd,
            max_holding_ms: i64::from(config.max_holding_hours) * 3_600_000,
            override_window_ms: i64::from(config.funding_override_minutes) * 60_000,
        }
    }

    /// Run one settlement pass. Accepted pairs are executed together and
    /// reported as a single notification.
    #[instrument(skip_all, name = "settle")]
    pub async fn run(
        &self,
        snapshot: &RiskSnapshot,
        rows: &[FundingFeeRow],
        tunables: &TunableParams,
    ) -> Result<Vec<SettledPair>> {
        let accepted = self.select(snapshot, rows, tunables, Utc::now()).await;
        if accepted.is_empty() {
            debug!("[SETTLE] No pair clears its threshold");
            return Ok(accepted);
        }

        let intents: Vec<OrderIntent> = accepted.iter().map(|s| s.intent.clone()).collect();
        self.executor.execute_batch("settle", &intents).await?;

        let mut lines = Vec::with_capacity(accepted.len());
        for pair in &accepted {
            let line = format!(
                "{} {}/{} {} {} @ {} bps (bar {} bps)",
                pair.intent.token,
                self.venues.name(pair.intent.base),
                self.venues.name(pair.intent.quote),
                pair.intent.direction,
                pair.intent.quantity,
                pair.delta_bps.round_dp(2),
                pair.threshold_bps.round_dp(2),
            );
            info!("[SETTLE] {}", line);
            lines.push(line);
        }
        self.alerts
            .send(&format!("[SETTLE] Locked {} pair(s)\n{}", accepted.len(), lines.join("\n")))
            .await;

        Ok(accepted)
    }

    /// Pairs that clear their bar at `now`, capped at `max_settle_pairs`.
    pub async fn select(
        &self,
        snapshot: &RiskSnapshot,
        rows: &[FundingFeeRow],
        tunables: &TunableParams,
        now: DateTime<Utc>,
    ) -> Vec<SettledPair> {
        let cap = tunables.max_settle_pairs as usize;
        let pairs = self.venues.pairs();

        let mut combos = Vec::new();
        for row in snapshot.rows.values() {
            if tunables.is_denied(&row.token) {
                debug!(token = %row.token, "[SETTLE] Denied token, skipping");
                continue;
            }
            for &(base, quote) in &pairs {
                let funding = rows
                    .iter()
                    .find(|r| r.token == row.token && r.base == base && r.quote == quote);
                combos.push((row, base, quote, funding));
            }
        }

        // Evaluated concurrently; the cap keeps token then pair order
        let evaluated = join_all(
            combos
                .into_iter()
                .map(|(row, base, quote, funding)| self.evaluate(row, base, quote, funding, tunables, now)),
        )
        .await;
        evaluated.into_iter().flatten().take(cap).collect()
    }

    async fn evaluate(
        &self,
        row: &TokenPositionRow,
        base: VenueId,
        quote: VenueId,
        funding: Option<&FundingFeeRow>,
        tunables: &TunableParams,
        now: DateTime<Utc>,
    ) -> Option<SettledPair> {
        let (base_leg, quote_leg) = row.hedged_legs(base, quote)?;
        let held = base_leg.direction()?;
        let closing = held.inverse();

        let market = PairMarket::load(
            &self.venues,
            &self.books,
            &row.token,
            (base, base_leg),
            (quote, quote_leg),
        )
        .await?;
        let Some(delta) = market.delta(closing) else {
            debug!(token = %row.token, "[SETTLE] No spread available");
            return None;
        };

        let carry = funding.map_or(Decimal::ZERO, |f| f.carry_bps(held));
        let hold_ms = self.hold_ms(&row.token, base, quote, now).await;
        let (min, max) = (tunables.min_settle_delta_bps, tunables.max_settle_delta_bps);
        let threshold = funding_override(
            min,
            max,
            carry,
            funding.and_then(|f| f.next_funding_time),
            now.timestamp_millis(),
            self.override_window_ms,
        )
        .unwrap_or_else(|| required_delta(min, max, carry, hold_ratio(hold_ms, self.max_holding_ms)));

        if delta < threshold {
            debug!(
                token = %row.token,
                delta = %delta.round_dp(2),
                threshold = %threshold.round_dp(2),
                hold_ms,
                "[SETTLE] Spread below threshold"
            );
            return None;
        }

        let price = market.base_price(closing)?;
        let half_smaller = base_leg.size().min(quote_leg.size()) / dec!(2);
        let quantity = (self.order_usd / price).min(half_smaller);
        let intent = market.intent(closing, quantity)?;

        Some(SettledPair {
            intent,
            delta_bps: delta,
            threshold_bps: threshold,
        })
    }

    /// Holding time of a pair; zero without a recorded open.
    async fn hold_ms(&self, token: &str, base: VenueId, quote: VenueId, now: DateTime<Utc>) -> i64 {
        let opened = self
            .clock
            .opened_at(token, self.venues.name(base), self.venues.name(quote))
            .await;
        match opened {
            Ok(Some(at)) => (now - at).num_milliseconds().max(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(%token, error = %e, "[SETTLE] Open timestamp unreadable, treating as new");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::exchange::{BookLevel, Direction, MockExchange, OrderBook};
    use crate::notify::MockNotifier;
    use crate::risk::RiskAggregator;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[test]
    fn test_fresh_pair_without_bias_requires_max() {
        assert_eq!(required_delta(dec!(5), dec!(20), Decimal::ZERO, Decimal::ZERO), dec!(20));
    }

    #[test]
    fn test_full_hold_requires_min_for_any_bias() {
        for bias in [dec!(-100), dec!(-7), Decimal::ZERO, dec!(3), dec!(100)] {
            assert_eq!(required_delta(dec!(5), dec!(20), bias, Decimal::ONE), dec!(5));
        }
        assert_eq!(hold_ratio(72 * 3_600_000, 72 * 3_600_000), Decimal::ONE);
        assert_eq!(hold_ratio(100 * 3_600_000, 72 * 3_600_000), Decimal::ONE);
        assert_eq!(hold_ratio(-5, 1000), Decimal::ZERO);
    }

    #[test]
    fn test_threshold_monotone_and_bounded() {
        let (min, max) = (dec!(5), dec!(20));
        for bias in [dec!(-40), dec!(-15), dec!(-6), dec!(-0.5), Decimal::ZERO, dec!(4), dec!(40)] {
            let mut previous = None;
            for step in 0..=10 {
                let ratio = Decimal::from(step) / dec!(10);
                let t = required_delta(min, max, bias, ratio);
                assert!(t >= min && t <= max, "{} out of bounds", t);
                if let Some(p) = previous {
                    assert!(t <= p);
                }
                previous = Some(t);
            }
        }
    }

    #[test]
    fn test_paying_carry_lowers_starting_bar() {
        // max + clamp(-6, -15, 15) = 14, halfway decay → 5 + 9 × 0.5
        assert_eq!(required_delta(dec!(5), dec!(20), dec!(-6), dec!(0.5)), dec!(9.5));
        assert_eq!(required_delta(dec!(5), dec!(20), dec!(-100), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn test_override_near_funding() {
        let now = 1_000_000;
        let window = 5 * 60_000;
        assert_eq!(funding_override(dec!(5), dec!(20), dec!(-3), Some(now + 60_000), now, window), Some(dec!(5)));
        assert_eq!(funding_override(dec!(5), dec!(20), dec!(3), Some(now + 60_000), now, window), Some(dec!(20)));
        assert_eq!(funding_override(dec!(5), dec!(20), dec!(3), Some(now + window + 1), now, window), None);
        assert_eq!(funding_override(dec!(5), dec!(20), dec!(3), Some(now - 1), now, window), None);
        assert_eq!(funding_override(dec!(5), dec!(20), dec!(3), None, now, window), None);
    }

    struct Harness {
        a: Arc<MockExchange>,
        b: Arc<MockExchange>,
        clock: PositionClock,
        engine: SettlementEngine,
        venues: VenueSet,
    }

    /// BTC long 1 on BINANCE, short 1 on OKX, ~10 bps to close.
    async fn harness(notifier: MockNotifier) -> Harness {
        harness_with(notifier, &["BTC"]).await
    }

    /// Every token held the same way on the same books.
    async fn harness_with(notifier: MockNotifier, tokens: &[&str]) -> Harness {
        let a = Arc::new(MockExchange::new("BINANCE"));
        let b = Arc::new(MockExchange::new("OKX"));
        let store = Arc::new(MemoryStore::new());
        let books = OrderBookCache::new(store.clone(), "FUNDING", Duration::from_secs(5));
        let now = Utc::now().timestamp_millis();
        let base_book = OrderBook {
            update_time: now,
            bids: vec![BookLevel(dec!(100.1), dec!(5))],
            asks: vec![BookLevel(dec!(100.2), dec!(5))],
        };
        let quote_book = OrderBook {
            update_time: now,
            bids: vec![BookLevel(dec!(99.9), dec!(5))],
            asks: vec![BookLevel(dec!(100.0), dec!(5))],
        };
        for token in tokens {
            a.set_position(token, dec!(1), 5).await;
            b.set_position(token, dec!(-1), 5).await;
            a.set_index_price(token, dec!(100)).await;
            let symbol = format!("{}USDT", token);
            books.put("BINANCE", &symbol, &base_book).await.unwrap();
            books.put("OKX", &symbol, &quote_book).await.unwrap();
        }

        let venues = VenueSet::new(vec![a.clone(), b.clone()]);
        let clock = PositionClock::new(store, "FUNDING");
        let executor = Arc::new(OrderExecutor::new(
            venues.clone(),
            ExecutionConfig {
                poll_interval_ms: 1,
                poll_retries: 2,
                jitter_min_ms: 0,
                jitter_max_ms: 0,
            },
        ));
        let alerts = Arc::new(AlertDispatcher::new(Arc::new(notifier), "ops"));
        let engine = SettlementEngine::new(
            venues.clone(),
            books,
            clock.clone(),
            executor,
            alerts,
            &KeeperConfig::default(),
        );
        Harness { a, b, clock, engine, venues }
    }

    #[tokio::test]
    async fn test_missing_timestamp_requires_max_spread() {
        let h = harness(MockNotifier::new()).await;
        let snapshot = RiskAggregator::new(h.venues.clone()).snapshot().await.unwrap();

        let accepted = h
            .engine
            .select(&snapshot, &[], &TunableParams::default(), Utc::now())
            .await;
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn test_old_pair_is_locked_with_half_leg_cap() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|_, text| text.starts_with("[SETTLE] Locked 1 pair(s)"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(notifier).await;
        let opened = Utc::now() - ChronoDuration::hours(72);
        h.clock.mark_opened("BTC", "BINANCE", "OKX", opened).await.unwrap();
        let snapshot = RiskAggregator::new(h.venues.clone()).snapshot().await.unwrap();

        let settled = h
            .engine
            .run(&snapshot, &[], &TunableParams::default())
            .await
            .unwrap();

        assert_eq!(settled.len(), 1);
        let intent = &settled[0].intent;
        assert_eq!(intent.direction, Direction::Short);
        // 200 USD / 100.1 ≈ 1.998, capped at half of the 1.0 leg
        assert_eq!(intent.quantity, dec!(0.5));
        assert_eq!(settled[0].threshold_bps, dec!(5));
        assert_eq!(h.a.position("BTC").await, dec!(0.5));
        assert_eq!(h.b.position("BTC").await, dec!(-0.5));
    }

    #[tokio::test]
    async fn test_denied_tokens_are_not_settled() {
        let h = harness(MockNotifier::new()).await;
        let opened = Utc::now() - ChronoDuration::hours(72);
        h.clock.mark_opened("BTC", "BINANCE", "OKX", opened).await.unwrap();
        let snapshot = RiskAggregator::new(h.venues.clone()).snapshot().await.unwrap();
        let mut tunables = TunableParams::default();
        tunables.deny_tokens = vec!["btc".into()];

        assert!(h.engine.select(&snapshot, &[], &tunables, Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_accepted_pairs_capped_in_token_order() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|_, text| text.starts_with("[SETTLE] Locked 3 pair(s)"))
            .times(1)
            .returning(|_, _| Ok(()));
        let tokens = ["AAA", "BBB", "CCC", "DDD"];
        let h = harness_with(notifier, &tokens).await;
        let opened = Utc::now() - ChronoDuration::hours(72);
        for token in tokens {
            h.clock.mark_opened(token, "BINANCE", "OKX", opened).await.unwrap();
        }
        let snapshot = RiskAggregator::new(h.venues.clone()).snapshot().await.unwrap();
        let mut tunables = TunableParams::default();
        tunables.max_settle_pairs = 3;

        let settled = h.engine.run(&snapshot, &[], &tunables).await.unwrap();

        let locked: Vec<_> = settled.iter().map(|s| s.intent.token.as_str()).collect();
        assert_eq!(locked, vec!["AAA", "BBB", "CCC"]);
        assert_eq!(h.a.position("CCC").await, dec!(0.5));
        assert_eq!(h.a.position("DDD").await, dec!(1));
        assert_eq!(h.b.position("DDD").await, dec!(-1));
    }
}
