//! Hedge rebalancing to keep every token delta neutral across venues.

use anyhow::Result;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::executor::OrderExecutor;
use crate::error::ExecutionError;
use crate::exchange::{Direction, VenueId, VenueSet};
use crate::risk::{RiskSnapshot, TokenPositionRow};

/// Corrective order for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalancePlan {
    pub token: String,
    pub venue: VenueId,
    pub symbol: String,
    /// Direction of the corrective order on `venue`
    pub direction: Direction,
    /// Long total minus short total, as a magnitude
    pub diff_size: Decimal,
    /// Quantity after the USD and position caps, before snapping
    pub quantity: Decimal,
}

/// Plan the corrective order restoring balance for one token, if any.
///
/// The heavier side is trimmed on its first venue in configuration order. The
/// quantity is capped at `max_rebalance_usd` of notional and at that venue's
/// own position, so the venue never flips sign.
pub fn plan_token(row: &TokenPositionRow, max_rebalance_usd: Decimal) -> Option<RebalancePlan> {
    let mut long_sum = Decimal::ZERO;
    let mut short_sum = Decimal::ZERO;
    let mut first_long = None;
    let mut first_short = None;

    for (venue, position) in &row.positions {
        match position.direction() {
            Some(Direction::Long) => {
                long_sum += position.size();
                first_long.get_or_insert((*venue, position));
            }
            Some(Direction::Short) => {
                short_sum += position.size();
                first_short.get_or_insert((*venue, position));
            }
            None => {}
        }
    }

    let (diff_size, (venue, position), direction) = if long_sum > short_sum {
        (long_sum - short_sum, first_long?, Direction::Short)
    } else if short_sum > long_sum {
        (short_sum - long_sum, first_short?, Direction::Long)
    } else {
        return None;
    };

    let Some(price) = row.index_price.filter(|p| *p > Decimal::ZERO) else {
        warn!(token = %row.token, %diff_size, "[REBALANCE] No index price, skipping");
        return None;
    };

    let quantity = diff_size
        .min(max_rebalance_usd / price)
        .min(position.size());

    Some(RebalancePlan {
        token: row.token.clone(),
        venue,
        symbol: position.symbol.clone(),
        direction,
        diff_size,
        quantity,
    })
}

/// Nets long against short exposure per token.
pub struct HedgeRebalancer {
    venues: VenueSet,
    executor: Arc<OrderExecutor>,
}

impl HedgeRebalancer {
    pub fn new(venues: VenueSet, executor: Arc<OrderExecutor>) -> Self {
        Self { venues, executor }
    }

    /// Plans for every imbalanced token, snapped to each venue's filter.
    /// Filters are fetched concurrently; plans keep token order.
    pub async fn plan(&self, snapshot: &RiskSnapshot, max_rebalance_usd: Decimal) -> Vec<RebalancePlan> {
        join_all(
            snapshot
                .rows
                .values()
                .filter_map(|row| plan_token(row, max_rebalance_usd))
                .map(|plan| self.snap(plan)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn snap(&self, mut plan: RebalancePlan) -> Option<RebalancePlan> {
        let adapter = self.venues.get(plan.venue)?;
        let filter = match adapter.qty_filter(&plan.symbol).await {
            Ok(filter) => filter,
            Err(e) => {
                warn!(token = %plan.token, venue = %adapter.name(), error = %e, "[REBALANCE] Quantity filter unavailable");
                return None;
            }
        };

        let snapped = filter.snap(plan.quantity);
        if snapped == Decimal::ZERO {
            debug!(
                token = %plan.token,
                qty = %plan.quantity,
                min_qty = %filter.min_qty,
                "[REBALANCE] Imbalance below minimum quantity"
            );
            return None;
        }
        plan.quantity = snapped;
        Some(plan)
    }

    /// Fire one corrective order per imbalanced token. Returns the number of
    /// orders placed; any failed order fails the whole pass.
    pub async fn run(&self, snapshot: &RiskSnapshot, max_rebalance_usd: Decimal) -> Result<usize> {
        let plans = self.plan(snapshot, max_rebalance_usd).await;
        if plans.is_empty() {
            return Ok(0);
        }

        for plan in &plans {
            info!(
                token = %plan.token,
                venue = %self.venues.name(plan.venue),
                direction = %plan.direction,
                diff = %plan.diff_size,
                qty = %plan.quantity,
                "[REBALANCE] Correcting imbalance"
            );
        }

        let results = join_all(plans.iter().map(|plan| {
            self.executor.execute_single(
                plan.venue,
                &plan.token,
                &plan.symbol,
                plan.direction.side(),
                plan.quantity,
            )
        }))
        .await;

        let failed = results
            .iter()
            .zip(&plans)
            .filter_map(|(result, plan)| result.as_ref().err().map(|e| (plan, e)))
            .inspect(|(plan, e)| error!(token = %plan.token, error = %e, "[REBALANCE] Order failed"))
            .count();

        if failed > 0 {
            return Err(ExecutionError::BatchFailed {
                phase: "rebalance",
                failed,
                total: plans.len(),
            }
            .into());
        }
        Ok(plans.len())
    }
}
