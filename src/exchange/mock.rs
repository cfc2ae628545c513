//! In-memory exchange adapter for paper trading and tests.

use super::traits::{ExchangeAdapter, VenueId};
use super::types::*;
use crate::config::TunableParams;
use crate::risk::{leverage_signal, RiskSnapshot};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated position on one token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockPosition {
    pub amount: Decimal,
    pub leverage: u32,
}

/// A simulated order, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

/// Mutable venue state.
#[derive(Debug)]
pub struct MockVenueState {
    pub equity: Decimal,
    pub positions: HashMap<String, MockPosition>,
    pub index_prices: HashMap<String, Decimal>,
    pub funding: HashMap<String, FundingSnapshot>,
    pub intervals: HashMap<String, u32>,
    pub filters: HashMap<String, QtyFilter>,
    pub default_filter: QtyFilter,
    pub orders: Vec<MockOrder>,
    pub leverage_calls: Vec<(String, u32)>,
    /// Tokens this venue has no symbol for
    pub unmapped: HashSet<String>,
    pub fail_account: bool,
    pub fail_funding: bool,
    pub reject_orders: bool,
    /// Orders never report completion
    pub pending_orders: bool,
    pub forced_signal: Option<DecreaseSignal>,
}

impl Default for MockVenueState {
    fn default() -> Self {
        Self {
            equity: dec!(10000),
            positions: HashMap::new(),
            index_prices: HashMap::new(),
            funding: HashMap::new(),
            intervals: HashMap::new(),
            filters: HashMap::new(),
            default_filter: QtyFilter {
                min_qty: dec!(0.001),
                step_size: dec!(0.001),
                price_precision: 2,
                qty_precision: 3,
            },
            orders: Vec::new(),
            leverage_calls: Vec::new(),
            unmapped: HashSet::new(),
            fail_account: false,
            fail_funding: false,
            reject_orders: false,
            pending_orders: false,
            forced_signal: None,
        }
    }
}

/// Mock venue that simulates fills against its own position book.
pub struct MockExchange {
    name: String,
    symbol_suffix: String,
    default_interval_hours: u32,
    latency: Duration,
    state: Arc<RwLock<MockVenueState>>,
    order_id_counter: AtomicU64,
    interval_queries: AtomicUsize,
}

impl MockExchange {
    /// Create a new mock venue with $10k equity and "USDT" symbols.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol_suffix: "USDT".to_string(),
            default_interval_hours: 8,
            latency: Duration::ZERO,
            state: Arc::new(RwLock::new(MockVenueState::default())),
            order_id_counter: AtomicU64::new(1),
            interval_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_symbol_suffix(mut self, suffix: &str) -> Self {
        self.symbol_suffix = suffix.to_string();
        self
    }

    pub fn with_funding_interval(mut self, hours: u32) -> Self {
        self.default_interval_hours = hours;
        self
    }

    /// Delay account and quantity filter calls, to make cycles observable while running.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of funding interval lookups served so far.
    pub fn interval_queries(&self) -> usize {
        self.interval_queries.load(Ordering::Relaxed)
    }

    pub async fn set_equity(&self, equity: Decimal) {
        self.state.write().await.equity = equity;
    }

    pub async fn set_position(&self, token: &str, amount: Decimal, leverage: u32) {
        self.state
            .write()
            .await
            .positions
            .insert(token.to_string(), MockPosition { amount, leverage });
    }

    pub async fn set_index_price(&self, token: &str, price: Decimal) {
        self.state
            .write()
            .await
            .index_prices
            .insert(token.to_string(), price);
    }

    pub async fn set_funding(&self, token: &str, rate: Decimal, next_funding_time: i64) {
        self.state.write().await.funding.insert(
            token.to_string(),
            FundingSnapshot {
                rate,
                next_funding_time,
            },
        );
    }

    pub async fn set_interval(&self, token: &str, hours: u32) {
        self.state
            .write()
            .await
            .intervals
            .insert(token.to_string(), hours);
    }

    pub async fn set_filter(&self, token: &str, filter: QtyFilter) {
        self.state
            .write()
            .await
            .filters
            .insert(token.to_string(), filter);
    }

    pub async fn unmap_token(&self, token: &str) {
        self.state.write().await.unmapped.insert(token.to_string());
    }

    pub async fn set_fail_account(&self, fail: bool) {
        self.state.write().await.fail_account = fail;
    }

    pub async fn set_fail_funding(&self, fail: bool) {
        self.state.write().await.fail_funding = fail;
    }

    pub async fn set_reject_orders(&self, reject: bool) {
        self.state.write().await.reject_orders = reject;
    }

    pub async fn set_pending_orders(&self, pending: bool) {
        self.state.write().await.pending_orders = pending;
    }

    pub async fn force_signal(&self, signal: DecreaseSignal) {
        self.state.write().await.forced_signal = Some(signal);
    }

    /// Orders placed so far.
    pub async fn orders(&self) -> Vec<MockOrder> {
        self.state.read().await.orders.clone()
    }

    /// Leverage updates issued so far.
    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.read().await.leverage_calls.clone()
    }

    /// Current signed amount on a token.
    pub async fn position(&self, token: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(token)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    fn token_of(&self, symbol: &str) -> Option<String> {
        symbol
            .strip_suffix(self.symbol_suffix.as_str())
            .map(str::to_string)
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn symbol_for(&self, state: &MockVenueState, token: &str) -> Option<String> {
        if state.unmapped.contains(token) {
            None
        } else {
            Some(format!("{}{}", token, self.symbol_suffix))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn orderbook_symbol(&self, token: &str) -> Option<String> {
        // try_read: symbol mapping is sync and must not block the runtime
        match self.state.try_read() {
            Ok(state) => self.symbol_for(&state, token),
            Err(_) => Some(format!("{}{}", token, self.symbol_suffix)),
        }
    }

    fn exchange_symbol(&self, token: &str) -> Option<String> {
        self.orderbook_symbol(token)
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let state = self.state.read().await;
        if state.fail_account {
            bail!("{} account endpoint unavailable", self.name);
        }
        Ok(AccountInfo {
            equity: state.equity,
            available: state.equity,
        })
    }

    async fn positions(&self) -> Result<Vec<VenuePosition>> {
        let state = self.state.read().await;
        if state.fail_account {
            bail!("{} position endpoint unavailable", self.name);
        }
        let mut positions: Vec<VenuePosition> = state
            .positions
            .iter()
            .filter(|(_, p)| p.amount != Decimal::ZERO)
            .map(|(token, p)| VenuePosition {
                token: token.clone(),
                symbol: format!("{}{}", token, self.symbol_suffix),
                amount: p.amount,
                leverage: p.leverage,
            })
            .collect();
        positions.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(positions)
    }

    async fn ensure_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.state.write().await;
        state.leverage_calls.push((symbol.to_string(), leverage));
        if let Some(token) = self.token_of(symbol) {
            if let Some(position) = state.positions.get_mut(&token) {
                position.leverage = leverage;
            }
        }
        debug!(venue = %self.name, %symbol, %leverage, "Mock set leverage");
        Ok(())
    }

    async fn qty_filter(&self, symbol: &str) -> Result<QtyFilter> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let state = self.state.read().await;
        let filter = self
            .token_of(symbol)
            .and_then(|token| state.filters.get(&token).copied())
            .unwrap_or(state.default_filter);
        Ok(filter)
    }

    async fn place_market_order(&self, symbol: &str, side: OrderSide, qty: Decimal) -> Result<String> {
        let mut state = self.state.write().await;
        if state.reject_orders {
            bail!("{} rejected order on {}", self.name, symbol);
        }
        let Some(token) = self.token_of(symbol) else {
            bail!("{} does not list {}", self.name, symbol);
        };

        let position = state.positions.entry(token).or_insert(MockPosition {
            amount: Decimal::ZERO,
            leverage: 1,
        });
        match side {
            OrderSide::Buy => position.amount += qty,
            OrderSide::Sell => position.amount -= qty,
        }

        let order_id = self.next_order_id().to_string();
        state.orders.push(MockOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity: qty,
        });

        info!(
            venue = %self.name,
            %order_id,
            %symbol,
            %side,
            quantity = %qty,
            "Mock market order executed"
        );
        Ok(order_id)
    }

    async fn query_order(&self, _symbol: &str, order_id: &str) -> Result<OrderState> {
        let state = self.state.read().await;
        let order = state.orders.iter().find(|o| o.order_id == order_id);
        let Some(order) = order else {
            bail!("{} unknown order {}", self.name, order_id);
        };
        Ok(OrderState {
            order_id: order.order_id.clone(),
            is_completed: !state.pending_orders,
            executed_qty: if state.pending_orders {
                Decimal::ZERO
            } else {
                order.quantity
            },
        })
    }

    async fn current_funding(&self, symbol: &str) -> Result<FundingSnapshot> {
        let state = self.state.read().await;
        if state.fail_funding {
            bail!("{} funding endpoint unavailable", self.name);
        }
        let token = self.token_of(symbol).unwrap_or_default();
        match state.funding.get(&token) {
            Some(snapshot) => Ok(*snapshot),
            None => bail!("{} has no funding data for {}", self.name, symbol),
        }
    }

    async fn funding_interval_hours(&self, symbol: &str) -> Result<u32> {
        self.interval_queries.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        let token = self.token_of(symbol).unwrap_or_default();
        Ok(state
            .intervals
            .get(&token)
            .copied()
            .unwrap_or(self.default_interval_hours))
    }

    async fn index_price(&self, token: &str) -> Result<Option<Decimal>> {
        Ok(self.state.read().await.index_prices.get(token).copied())
    }

    fn decrease_signal(
        &self,
        venue: VenueId,
        snapshot: &RiskSnapshot,
        tunables: &TunableParams,
    ) -> DecreaseSignal {
        let forced = self.state.try_read().ok().and_then(|s| s.forced_signal);
        forced.unwrap_or_else(|| leverage_signal(self.name(), venue, snapshot, tunables))
    }
}
