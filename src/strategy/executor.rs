//! Two-leg order execution.
//!
//! Both legs of a corrective trade are submitted at the same time; each is
//! then polled until the venue reports it completed. A leg that fails after
//! its partner was accepted is reported as [`ExecutionError::OneSided`] and
//! left for the next cycle's rebalance to even out.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::future::join_all;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::exchange::{Direction, ExchangeAdapter, OrderSide, OrderState, VenueId, VenueSet};
use crate::persistence::{JournalEntry, PersistenceManager};

/// A paired corrective trade.
///
/// `direction` applies to the base venue; the quote venue trades the inverse.
/// `quantity` is already snapped to the pair's shared filter.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub token: String,
    pub base: VenueId,
    pub quote: VenueId,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
}

/// Completed pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFill {
    pub token: String,
    pub base: OrderState,
    pub quote: OrderState,
}

/// Places and polls corrective orders.
pub struct OrderExecutor {
    venues: VenueSet,
    config: ExecutionConfig,
    journal: Option<Arc<PersistenceManager>>,
}

impl OrderExecutor {
    pub fn new(venues: VenueSet, config: ExecutionConfig) -> Self {
        Self {
            venues,
            config,
            journal: None,
        }
    }

    /// Journal every submitted leg.
    pub fn with_journal(mut self, journal: Arc<PersistenceManager>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Execute one paired trade.
    pub async fn execute_pair(&self, phase: &'static str, intent: &OrderIntent) -> Result<PairFill> {
        let base = self.adapter(intent.base)?;
        let quote = self.adapter(intent.quote)?;
        let base_side = intent.direction.side();
        let quote_side = base_side.opposite();

        info!(
            token = %intent.token,
            base = %base.name(),
            quote = %quote.name(),
            direction = %intent.direction,
            qty = %intent.quantity,
            "[{}] Submitting paired orders",
            phase.to_uppercase()
        );

        let (base_res, quote_res) = tokio::join!(
            base.place_market_order(&intent.base_symbol, base_side, intent.quantity),
            quote.place_market_order(&intent.quote_symbol, quote_side, intent.quantity),
        );

        self.journal_legs(
            phase,
            intent,
            [
                (base.name(), &intent.base_symbol, base_side, &base_res),
                (quote.name(), &intent.quote_symbol, quote_side, &quote_res),
            ],
        );

        let (base_id, quote_id) = match (base_res, quote_res) {
            (Ok(b), Ok(q)) => (b, q),
            (Ok(_), Err(e)) => {
                error!(token = %intent.token, venue = %quote.name(), error = %e, "Quote leg rejected after base leg accepted");
                return Err(ExecutionError::OneSided {
                    token: intent.token.clone(),
                    filled_venue: base.name().to_string(),
                    failed_venue: quote.name().to_string(),
                    quantity: intent.quantity,
                }
                .into());
            }
            (Err(e), Ok(_)) => {
                error!(token = %intent.token, venue = %base.name(), error = %e, "Base leg rejected after quote leg accepted");
                return Err(ExecutionError::OneSided {
                    token: intent.token.clone(),
                    filled_venue: quote.name().to_string(),
                    failed_venue: base.name().to_string(),
                    quantity: intent.quantity,
                }
                .into());
            }
            (Err(e), Err(_)) => {
                return Err(ExecutionError::Rejected {
                    venue: base.name().to_string(),
                    symbol: intent.base_symbol.clone(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        self.settle_delay().await;

        let (base_state, quote_state) = tokio::try_join!(
            self.await_completion(base.as_ref(), &intent.base_symbol, &base_id),
            self.await_completion(quote.as_ref(), &intent.quote_symbol, &quote_id),
        )?;

        debug!(token = %intent.token, %base_id, %quote_id, "Paired orders completed");
        Ok(PairFill {
            token: intent.token.clone(),
            base: base_state,
            quote: quote_state,
        })
    }

    /// Execute a single-venue order, used by the rebalancer.
    pub async fn execute_single(
        &self,
        venue: VenueId,
        token: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderState> {
        let adapter = self.adapter(venue)?;
        let placed = adapter.place_market_order(symbol, side, quantity).await;

        if let Some(journal) = &self.journal {
            let entry = journal_entry("rebalance", token, adapter.name(), symbol, side, quantity, &placed);
            if let Err(e) = journal.record_orders(&[entry]) {
                warn!(error = %e, "Failed to journal rebalance order");
            }
        }

        let order_id = placed.map_err(|e| ExecutionError::Rejected {
            venue: adapter.name().to_string(),
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })?;

        self.settle_delay().await;
        self.await_completion(adapter.as_ref(), symbol, &order_id).await
    }

    /// Execute every intent concurrently. The batch fails when any pair fails.
    pub async fn execute_batch(&self, phase: &'static str, intents: &[OrderIntent]) -> Result<Vec<PairFill>> {
        let results = join_all(intents.iter().map(|intent| self.execute_pair(phase, intent))).await;

        let mut fills = Vec::with_capacity(results.len());
        let mut failed = 0;
        for (intent, result) in intents.iter().zip(results) {
            match result {
                Ok(fill) => fills.push(fill),
                Err(e) => {
                    failed += 1;
                    error!(token = %intent.token, error = %e, "[{}] Pair execution failed", phase.to_uppercase());
                }
            }
        }

        if failed > 0 {
            return Err(ExecutionError::BatchFailed {
                phase,
                failed,
                total: intents.len(),
            }
            .into());
        }
        Ok(fills)
    }

    /// Poll an order until completed or the retry budget runs out.
    async fn await_completion(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderState> {
        let attempts = self.config.poll_retries.max(1);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match adapter.query_order(symbol, order_id).await {
                Ok(state) if state.is_completed => return Ok(state),
                Ok(_) => {
                    last_error = None;
                    debug!(venue = %adapter.name(), %symbol, %order_id, attempt, "Order not completed yet");
                }
                Err(e) => {
                    warn!(venue = %adapter.name(), %symbol, %order_id, attempt, error = %e, "Order status query failed");
                    last_error = Some(e.to_string());
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        let err = match last_error {
            Some(reason) => ExecutionError::QueryFailed {
                venue: adapter.name().to_string(),
                order_id: order_id.to_string(),
                reason,
            },
            None => ExecutionError::Timeout {
                venue: adapter.name().to_string(),
                symbol: symbol.to_string(),
                order_id: order_id.to_string(),
                attempts,
            },
        };
        Err(err.into())
    }

    async fn settle_delay(&self) {
        let delay = self.jitter();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn jitter(&self) -> Duration {
        let (lo, hi) = (self.config.jitter_min_ms, self.config.jitter_max_ms);
        let ms = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        Duration::from_millis(ms)
    }

    fn adapter(&self, venue: VenueId) -> Result<Arc<dyn ExchangeAdapter>> {
        self.venues
            .get(venue)
            .cloned()
            .ok_or_else(|| anyhow!("unknown venue {}", venue))
    }

    fn journal_legs(
        &self,
        phase: &str,
        intent: &OrderIntent,
        legs: [(&str, &String, OrderSide, &Result<String>); 2],
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let entries: Vec<JournalEntry> = legs
            .into_iter()
            .map(|(venue, symbol, side, placed)| {
                journal_entry(phase, &intent.token, venue, symbol, side, intent.quantity, placed)
            })
            .collect();
        if let Err(e) = journal.record_orders(&entries) {
            warn!(token = %intent.token, error = %e, "Failed to journal paired orders");
        }
    }
}

fn journal_entry(
    phase: &str,
    token: &str,
    venue: &str,
    symbol: &str,
    side: OrderSide,
    quantity: Decimal,
    placed: &Result<String>,
) -> JournalEntry {
    JournalEntry {
        timestamp: Utc::now(),
        phase: phase.to_string(),
        token: token.to_string(),
        venue: venue.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity,
        order_id: placed.as_ref().ok().cloned(),
        status: if placed.is_ok() { "submitted" } else { "rejected" }.to_string(),
    }
}
