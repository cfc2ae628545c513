//! Venue-agnostic exchange capability.
//!
//! Every core component talks to venues exclusively through
//! [`ExchangeAdapter`]. Signing, retries and rate limits live behind the
//! adapter; the keeper only sees normalized tokens, venue-local symbols and
//! decimal quantities.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

use super::types::{
    AccountInfo, DecreaseSignal, FundingSnapshot, OrderSide, OrderState, QtyFilter, VenuePosition,
};
use crate::config::TunableParams;
use crate::risk::{leverage_signal, RiskSnapshot};

/// Per-venue capability consumed by the keeper.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable exchange name used in cache keys and logs (e.g. "BINANCE").
    fn name(&self) -> &str;

    /// Symbol under which the market-data collectors cache this token's book.
    fn orderbook_symbol(&self, token: &str) -> Option<String>;

    /// Symbol used for trading calls on this venue.
    fn exchange_symbol(&self, token: &str) -> Option<String>;

    async fn account_info(&self) -> anyhow::Result<AccountInfo>;

    /// All open positions on this venue.
    async fn positions(&self) -> anyhow::Result<Vec<VenuePosition>>;

    async fn ensure_leverage(&self, symbol: &str, leverage: u32) -> anyhow::Result<()>;

    async fn qty_filter(&self, symbol: &str) -> anyhow::Result<QtyFilter>;

    /// Place a taker order and return the venue order id.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
    ) -> anyhow::Result<String>;

    async fn query_order(&self, symbol: &str, order_id: &str) -> anyhow::Result<OrderState>;

    async fn current_funding(&self, symbol: &str) -> anyhow::Result<FundingSnapshot>;

    /// Funding interval for the symbol, in hours.
    async fn funding_interval_hours(&self, symbol: &str) -> anyhow::Result<u32>;

    /// Index price for a token, if the venue publishes one.
    async fn index_price(&self, token: &str) -> anyhow::Result<Option<Decimal>>;

    /// Whether this venue's exposure requires the book to shrink.
    ///
    /// The default compares the venue's leverage against its margin band in
    /// the tunables.
    fn decrease_signal(
        &self,
        venue: VenueId,
        snapshot: &RiskSnapshot,
        tunables: &TunableParams,
    ) -> DecreaseSignal {
        leverage_signal(self.name(), venue, snapshot, tunables)
    }
}

/// Ordinal of a venue in the configured venue list.
///
/// Stable within one run only; never persisted. Ordering follows the
/// configuration, which several tie-breaks depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VenueId(pub usize);

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The configured venues, in configuration order.
#[derive(Clone, Default)]
pub struct VenueSet {
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
}

impl VenueSet {
    pub fn new(adapters: Vec<Arc<dyn ExchangeAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn get(&self, venue: VenueId) -> Option<&Arc<dyn ExchangeAdapter>> {
        self.adapters.get(venue.0)
    }

    /// Exchange name of a venue, or `"?"` for an unknown ordinal.
    pub fn name(&self, venue: VenueId) -> &str {
        self.get(venue).map(|a| a.name()).unwrap_or("?")
    }

    /// Venues in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (VenueId, &Arc<dyn ExchangeAdapter>)> {
        self.adapters
            .iter()
            .enumerate()
            .map(|(i, adapter)| (VenueId(i), adapter))
    }

    /// Every unordered venue pair `(base, quote)` with `base < quote`.
    pub fn pairs(&self) -> Vec<(VenueId, VenueId)> {
        let n = self.adapters.len();
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (VenueId(i), VenueId(j))))
            .collect()
    }
}

impl fmt::Debug for VenueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|a| a.name()))
            .finish()
    }
}
